// src/core/errors.rs

//! Defines the primary error type for the entire agent.

use thiserror::Error;

/// The main error enum, representing all possible failures within the agent.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue storage error: {0}")]
    Queue(String),

    #[error("Rule store error: {0}")]
    RuleStore(String),

    #[error("Bus publish error: {0}")]
    Bus(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// --- From trait implementations for easy error conversion ---

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        AgentError::HttpClient(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Queue(e.to_string())
    }
}

impl From<regex::Error> for AgentError {
    fn from(e: regex::Error) -> Self {
        AgentError::Config(format!("invalid keyword pattern: {e}"))
    }
}
