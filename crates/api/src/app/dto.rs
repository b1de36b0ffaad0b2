use serde::{Deserialize, Serialize};

use snipstash_auth::PrincipalProfile;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RenewAccessTokenRequest {
    pub refresh_token: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: PrincipalProfile,
}
