use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::BadRequest(format!("Validation failed: {errors}")))
}

fn default_expires_in_days() -> i64 {
    14
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoginInput {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshInput {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AcceptInviteInput {
    #[validate(length(min = 1))]
    pub token: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateInviteInput {
    #[validate(email)]
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default = "default_expires_in_days")]
    pub expires_in_days: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateUserInput {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateUserInput {
    #[serde(default)]
    pub roles: Option<Vec<String>>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub password: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_input_requires_an_email() {
        let bad: LoginInput = serde_json::from_value(serde_json::json!({
            "email": "not-an-email",
            "password": "x",
        }))
        .unwrap();
        assert!(validate_input(&bad).is_err());

        let good: LoginInput = serde_json::from_value(serde_json::json!({
            "email": "user@example.com",
            "password": "x",
        }))
        .unwrap();
        assert!(validate_input(&good).is_ok());
    }

    #[test]
    fn invite_defaults() {
        let invite: CreateInviteInput = serde_json::from_value(serde_json::json!({
            "email": "new@example.com",
        }))
        .unwrap();
        assert!(invite.roles.is_empty());
        assert_eq!(invite.expires_in_days, 14);
    }
}
