use std::fmt;

/// Engine-wide error type.
///
/// Errors are `Clone` because a deduplicated in-flight request fans its
/// result out to every waiting caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TillSyncError {
    /// Network / HTTP failure. Retried implicitly by the next scheduled tick.
    Transport(String),
    /// 401-class failure. Triggers a global re-authentication flow and
    /// suppresses per-call error noise.
    Auth(String),
    /// Audit fetch failed. Degrades the coordinator to checkpoint-only pulls.
    Reconciliation(String),
    /// Local-store write failed while applying a page. The checkpoint is not
    /// advanced so the same page is retried next tick.
    Apply(String),
    /// Remote rejected a local optimistic write.
    MutationRejected {
        resource: String,
        id: String,
        message: String,
    },
    KvStore(String),
    Serialization(String),
    Io(String),
    Config(String),
    InvalidInput(String),
    /// The owning coordinator or scheduler was cancelled mid-operation.
    Cancelled,
}

impl fmt::Display for TillSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TillSyncError::Transport(e) => write!(f, "Transport error: {}", e),
            TillSyncError::Auth(e) => write!(f, "Authentication error: {}", e),
            TillSyncError::Reconciliation(e) => write!(f, "Reconciliation error: {}", e),
            TillSyncError::Apply(e) => write!(f, "Apply error: {}", e),
            TillSyncError::MutationRejected { resource, id, message } => {
                write!(f, "Mutation rejected for {} {}: {}", resource, id, message)
            }
            TillSyncError::KvStore(e) => write!(f, "KV store error: {}", e),
            TillSyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            TillSyncError::Io(e) => write!(f, "IO error: {}", e),
            TillSyncError::Config(e) => write!(f, "Config error: {}", e),
            TillSyncError::InvalidInput(e) => write!(f, "Invalid input: {}", e),
            TillSyncError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::error::Error for TillSyncError {}

impl From<serde_json::Error> for TillSyncError {
    fn from(error: serde_json::Error) -> Self {
        TillSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for TillSyncError {
    fn from(error: std::io::Error) -> Self {
        TillSyncError::Io(error.to_string())
    }
}

impl From<sled::Error> for TillSyncError {
    fn from(error: sled::Error) -> Self {
        TillSyncError::KvStore(error.to_string())
    }
}

impl From<reqwest::Error> for TillSyncError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                TillSyncError::Auth(format!("HTTP {}: {}", status, error))
            }
            _ => TillSyncError::Transport(error.to_string()),
        }
    }
}

impl TillSyncError {
    /// Build a transport error from an HTTP status line, classifying
    /// 401/403 as [`TillSyncError::Auth`].
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => TillSyncError::Auth(format!("HTTP {}: {}", status, body)),
            _ => TillSyncError::Transport(format!("HTTP {}: {}", status, body)),
        }
    }

    /// Status code of a transport or auth error built by [`from_status`],
    /// recovered from the `HTTP {code}:` prefix it writes.
    ///
    /// [`from_status`]: TillSyncError::from_status
    pub fn http_status(&self) -> Option<u16> {
        let message = match self {
            TillSyncError::Transport(m) | TillSyncError::Auth(m) => m,
            _ => return None,
        };
        let rest = message.strip_prefix("HTTP ")?;
        rest.split(':').next()?.trim().parse().ok()
    }

    /// Auth errors short-circuit all other error reporting for a request.
    pub fn is_auth(&self) -> bool {
        matches!(self, TillSyncError::Auth(_))
    }

    /// Whether the next scheduled tick may retry the failed operation.
    /// Transport and apply failures are retryable; rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TillSyncError::Transport(_) | TillSyncError::Apply(_) | TillSyncError::Reconciliation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TillSyncError>;
