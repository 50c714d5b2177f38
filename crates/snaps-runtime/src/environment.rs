use std::fmt;

use crate::transport::Transport;

/// Opaque reference to an isolated context created by an [`EnvironmentFactory`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextHandle {
    session_id: String,
    token: u64,
}

impl ContextHandle {
    pub fn new(session_id: impl Into<String>, token: u64) -> Self {
        Self {
            session_id: session_id.into(),
            token,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Factory-specific discriminator, e.g. a pool slot or process id.
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.token)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("execution environment unavailable: {0}")]
    Unavailable(String),
    #[error("failed to create isolated context: {0}")]
    Create(String),
    #[error("failed to destroy isolated context: {0}")]
    Destroy(String),
}

/// Creates and destroys the isolated contexts sessions run in.
///
/// Implementations decide the isolation boundary (a thread, a process, a pooled runtime addressed
/// by session id). The controller only sees the raw transport, which it multiplexes itself.
#[async_trait::async_trait]
pub trait EnvironmentFactory: Send + Sync {
    fn id(&self) -> &'static str;

    async fn create_context(
        &self,
        session_id: &str,
    ) -> Result<(ContextHandle, Transport), EnvironmentError>;

    /// Tear the context down. Returning is the completion signal: resources must be released by
    /// the time the future resolves.
    async fn destroy_context(&self, handle: ContextHandle) -> Result<(), EnvironmentError>;
}
