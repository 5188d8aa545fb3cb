// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the daemon.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum FabricError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Wrong number of arguments for '{0}'")]
    WrongArgumentCount(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("'{0}' is not a known event")]
    NotEvent(String),

    #[error("Nothing callable to register for event '{0}'")]
    NotCallable(String),

    #[error("Subscriber is not registered for event '{0}'")]
    UnknownCallable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Sharding error: {0}")]
    Sharding(String),

    #[error("No shard matches the given key")]
    NoSuchShard,

    #[error("Shard {0} is busy with another operation")]
    ShardBusy(u64),

    #[error("Group error: {0}")]
    Group(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Could not connect to server at {0}")]
    Connect(String),

    #[error("Authentication failed for server at {0}")]
    Auth(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Metadata transaction conflict on {0}")]
    TxnConflict(String),

    #[error("Executor is shutting down")]
    ShuttingDown,

    #[error("No procedure with id {0}")]
    UnknownProcedure(uuid::Uuid),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for FabricError {
    fn clone(&self) -> Self {
        match self {
            FabricError::Io(e) => FabricError::Io(Arc::clone(e)),
            FabricError::Service(s) => FabricError::Service(s.clone()),
            FabricError::Configuration(s) => FabricError::Configuration(s.clone()),
            FabricError::UnknownCommand(s) => FabricError::UnknownCommand(s.clone()),
            FabricError::WrongArgumentCount(s) => FabricError::WrongArgumentCount(s.clone()),
            FabricError::InvalidRequest(s) => FabricError::InvalidRequest(s.clone()),
            FabricError::NotEvent(s) => FabricError::NotEvent(s.clone()),
            FabricError::NotCallable(s) => FabricError::NotCallable(s.clone()),
            FabricError::UnknownCallable(s) => FabricError::UnknownCallable(s.clone()),
            FabricError::Timeout(s) => FabricError::Timeout(s.clone()),
            FabricError::Sharding(s) => FabricError::Sharding(s.clone()),
            FabricError::NoSuchShard => FabricError::NoSuchShard,
            FabricError::ShardBusy(id) => FabricError::ShardBusy(*id),
            FabricError::Group(s) => FabricError::Group(s.clone()),
            FabricError::Server(s) => FabricError::Server(s.clone()),
            FabricError::Connect(s) => FabricError::Connect(s.clone()),
            FabricError::Auth(s) => FabricError::Auth(s.clone()),
            FabricError::Database(s) => FabricError::Database(s.clone()),
            FabricError::TxnConflict(s) => FabricError::TxnConflict(s.clone()),
            FabricError::ShuttingDown => FabricError::ShuttingDown,
            FabricError::UnknownProcedure(id) => FabricError::UnknownProcedure(*id),
        }
    }
}

impl PartialEq for FabricError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FabricError::Io(e1), FabricError::Io(e2)) => e1.to_string() == e2.to_string(),
            (FabricError::Service(s1), FabricError::Service(s2)) => s1 == s2,
            (FabricError::Configuration(s1), FabricError::Configuration(s2)) => s1 == s2,
            (FabricError::UnknownCommand(s1), FabricError::UnknownCommand(s2)) => s1 == s2,
            (FabricError::WrongArgumentCount(s1), FabricError::WrongArgumentCount(s2)) => s1 == s2,
            (FabricError::InvalidRequest(s1), FabricError::InvalidRequest(s2)) => s1 == s2,
            (FabricError::NotEvent(s1), FabricError::NotEvent(s2)) => s1 == s2,
            (FabricError::NotCallable(s1), FabricError::NotCallable(s2)) => s1 == s2,
            (FabricError::UnknownCallable(s1), FabricError::UnknownCallable(s2)) => s1 == s2,
            (FabricError::Timeout(s1), FabricError::Timeout(s2)) => s1 == s2,
            (FabricError::Sharding(s1), FabricError::Sharding(s2)) => s1 == s2,
            (FabricError::ShardBusy(a), FabricError::ShardBusy(b)) => a == b,
            (FabricError::Group(s1), FabricError::Group(s2)) => s1 == s2,
            (FabricError::Server(s1), FabricError::Server(s2)) => s1 == s2,
            (FabricError::Connect(s1), FabricError::Connect(s2)) => s1 == s2,
            (FabricError::Auth(s1), FabricError::Auth(s2)) => s1 == s2,
            (FabricError::Database(s1), FabricError::Database(s2)) => s1 == s2,
            (FabricError::TxnConflict(s1), FabricError::TxnConflict(s2)) => s1 == s2,
            (FabricError::UnknownProcedure(a), FabricError::UnknownProcedure(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for FabricError {
    fn from(e: std::io::Error) -> Self {
        FabricError::Io(Arc::new(e))
    }
}

impl From<uuid::Error> for FabricError {
    fn from(e: uuid::Error) -> Self {
        FabricError::InvalidRequest(format!("malformed UUID: {e}"))
    }
}

impl From<ParseIntError> for FabricError {
    fn from(e: ParseIntError) -> Self {
        FabricError::InvalidRequest(format!("not an integer: {e}"))
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(e: serde_json::Error) -> Self {
        FabricError::Service(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<toml::de::Error> for FabricError {
    fn from(e: toml::de::Error) -> Self {
        FabricError::Configuration(e.to_string())
    }
}
