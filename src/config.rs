use std::env;

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub app_name: String,
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub platform_db_url: Option<String>,
    pub platform_jwt_secret: String,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_days: i64,
    pub db_pool_size: u32,
    pub storage_root: String,
    pub default_admin_email: String,
    pub default_admin_password: String,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
    pub scheduler_enabled: bool,
    pub webhook_retry_tick_seconds: u64,
    pub webhook_retry_batch_size: i64,
    pub workflow_timeout_tick_seconds: u64,
    pub webhook_timeout_seconds: u64,
}

impl PlatformConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "Rocket Backend"),
            environment: env_or("ENVIRONMENT", "development"),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            platform_db_url: env_opt("PLATFORM_DB_URL").or_else(|| env_opt("DATABASE_URL")),
            platform_jwt_secret: env_or("PLATFORM_JWT_SECRET", "dev-platform-secret"),
            access_token_ttl_minutes: env_parse_or("ACCESS_TOKEN_TTL_MINUTES", 15),
            refresh_token_ttl_days: env_parse_or("REFRESH_TOKEN_TTL_DAYS", 7),
            db_pool_size: env_parse_or("DB_POOL_SIZE", 50),
            storage_root: env_or("STORAGE_ROOT", "./storage"),
            default_admin_email: env_or("DEFAULT_ADMIN_EMAIL", "admin@example.com"),
            default_admin_password: env_or("DEFAULT_ADMIN_PASSWORD", "admin1234"),
            rate_limit_enabled: env_parse_bool_or("RATE_LIMIT_ENABLED", false),
            rate_limit_per_second: env_parse_or("RATE_LIMIT_PER_SECOND", 50),
            rate_limit_burst_size: env_parse_or("RATE_LIMIT_BURST_SIZE", 100),
            scheduler_enabled: env_parse_bool_or("SCHEDULER_ENABLED", true),
            webhook_retry_tick_seconds: env_parse_or("WEBHOOK_RETRY_TICK_SECONDS", 30),
            webhook_retry_batch_size: env_parse_or("WEBHOOK_RETRY_BATCH_SIZE", 20),
            workflow_timeout_tick_seconds: env_parse_or("WORKFLOW_TIMEOUT_TICK_SECONDS", 60),
            webhook_timeout_seconds: env_parse_or("WEBHOOK_TIMEOUT_SECONDS", 10),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    pub fn rate_limit_enabled_runtime(&self) -> bool {
        if self.is_production() {
            return true;
        }
        self.rate_limit_enabled
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => true,
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => false,
        Some(_) => default,
        None => default,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{parse_csv, PlatformConfig};

    #[test]
    fn csv_parsing_skips_blanks() {
        assert_eq!(
            parse_csv("a, b,,c "),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(parse_csv("").is_empty());
    }

    #[test]
    fn production_forces_rate_limiting() {
        let mut config = PlatformConfig::from_env();
        config.environment = "production".to_string();
        config.rate_limit_enabled = false;
        assert!(config.rate_limit_enabled_runtime());
    }
}
