pub mod audit;
pub mod permissions;
pub mod rules;
pub mod scheduler;
pub mod state_machine;
pub mod webhooks;
pub mod workflows;
