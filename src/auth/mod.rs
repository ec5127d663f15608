//! Caller identity.
//!
//! Authentication happens upstream (gateway or session layer). By the time a
//! request reaches this service it carries a verified `x-user-id` and
//! `x-user-role`; this module only turns those headers into an [`Identity`].

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Customer,
    Admin,
}

impl Role {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customer" | "user" => Some(Role::Customer),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Verified `(user_id, role)` pair supplied with every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

impl Identity {
    pub fn customer(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::Customer,
        }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), ServiceError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden("admin role required".to_string()))
        }
    }

    /// Owners and admins may act on an order.
    pub fn can_access(&self, owner_id: Uuid) -> bool {
        self.is_admin() || self.user_id == owner_id
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or_else(|| ServiceError::Unauthorized("missing or invalid user id".to_string()))?;

        let role = match parts.headers.get(USER_ROLE_HEADER) {
            None => Role::Customer,
            Some(value) => value
                .to_str()
                .ok()
                .and_then(Role::parse)
                .ok_or_else(|| ServiceError::Unauthorized("unknown role".to_string()))?,
        };

        Ok(Identity { user_id, role })
    }
}
