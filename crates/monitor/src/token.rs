//! Access tokens for the scheduler API.
//!
//! Tokens are minted and refreshed by an external process; the monitor only
//! reads whatever is current at the time of each request.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::SchedulerError;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, SchedulerError>;
}

/// A fixed token, for tests and short-lived tooling.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, SchedulerError> {
        Ok(self.0.clone())
    }
}

/// Re-reads the token from a file on every call.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenProvider for TokenFile {
    async fn token(&self) -> Result<String, SchedulerError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SchedulerError::TokenFile { path: self.path.clone(), source })?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(SchedulerError::Token(format!("{} is empty", self.path.display())));
        }
        Ok(token.to_string())
    }
}
