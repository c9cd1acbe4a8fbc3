//! Transaction boundary around command handlers

use crate::context::DispatchContext;
use async_trait::async_trait;
use thiserror::Error;

/// Failure to begin, commit or roll back a transaction
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct UnitOfWorkError(pub String);

impl UnitOfWorkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Source of transactions, one per command dispatch.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Open a transaction for the dispatch described by `ctx`.
    async fn begin(&self, ctx: &DispatchContext) -> Result<Box<dyn Transaction>, UnitOfWorkError>;
}

/// An open transaction
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> Result<(), UnitOfWorkError>;

    async fn rollback(self: Box<Self>) -> Result<(), UnitOfWorkError>;
}
