//! Session client seam.
//!
//! The orchestrator never talks to a model provider itself. The
//! hosting process supplies a [`SessionClient`] that can start a
//! detached session for an agent, read its transcript back, and abort
//! it. Session activity flows back in as [`SessionEvent`] values.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionClientError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One transcript entry of a detached session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: Role,
    pub text: String,
}

impl SessionMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// Activity reported by the runtime driving a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session executed a tool.
    ToolExecuted { session_id: String, tool: String },
    /// The session finished its work and went idle.
    Idle { session_id: String },
    /// The session failed.
    Error { session_id: String, message: String },
}

#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Create a detached session and dispatch `prompt` to the named
    /// agent. Returns the new session id.
    async fn create_session(
        &self,
        agent: &str,
        prompt: &str,
        parent_session_id: &str,
    ) -> Result<String, SessionClientError>;

    /// Full transcript of a session, oldest message first.
    async fn fetch_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionMessage>, SessionClientError>;

    /// Ask a session to stop. Resolves once the abort is acknowledged,
    /// not merely requested.
    async fn abort_session(&self, session_id: &str) -> Result<(), SessionClientError>;
}
