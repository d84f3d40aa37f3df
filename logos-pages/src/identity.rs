//! Identity collaborator: turns connection credentials into a user.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::block::UserId;
use crate::config::TokenGrant;

/// What a client presents when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
}

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    InvalidCredentials,
    Unavailable(String),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::InvalidCredentials => write!(f, "Invalid credentials"),
            IdentityError::Unavailable(e) => write!(f, "Identity service unavailable: {e}"),
        }
    }
}

impl std::error::Error for IdentityError {}

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, IdentityError>;
}

/// Fixed token table, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityService {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_grants(grants: &[TokenGrant]) -> Self {
        let mut service = Self::new();
        for grant in grants {
            service.grant(grant.token.clone(), grant.identity.clone());
        }
        service
    }

    pub fn grant(&mut self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    pub fn with_grant(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.grant(token, identity);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityService for StaticIdentityService {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, IdentityError> {
        self.tokens
            .get(&credentials.token)
            .cloned()
            .ok_or(IdentityError::InvalidCredentials)
    }
}
