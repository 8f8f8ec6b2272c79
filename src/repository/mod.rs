pub mod bootstrap;
pub mod migrator;
pub mod query_planner;
pub mod sql;
pub mod write_pipeline;
