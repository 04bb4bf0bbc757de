use serde::{Deserialize, Serialize};

/// Request body for registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    pub password: String,
}

/// Request body for login. `account` is a name or an email.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub account: String,
    pub password: String,
}

/// Request body for a password reset.
#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub account: String,
    pub new_password: String,
}

/// Response returned after login or register.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: PublicUser,
}

/// Public part of an account returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: i64,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct ResetPasswordResponse {
    pub updated: u64,
}

/// Request body for a wholesale stamp-set replacement.
#[derive(Debug, Deserialize)]
pub struct SaveStampsRequest {
    pub stamps: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct StampsResponse {
    pub stamps: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_user_serializes_without_credentials() {
        let user = PublicUser {
            id: 7,
            name: "cc".into(),
            email: "cc@example.com".into(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(json.contains("cc@example.com"));
        assert!(!json.contains("password"));
    }
}
