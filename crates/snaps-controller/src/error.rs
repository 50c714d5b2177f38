use serde::{Deserialize, Serialize};
use snaps_core::fsm::FsmError;
use snaps_core::permissions::PermissionError;
use snaps_core::request_queue::QueueError;
use snaps_core::version::VersionRangeError;
use snaps_core::{SnapId, SnapIdError};
use snaps_runtime::{HostError, LocationError};

use crate::execution::ExecutionError;

/// Coarse classification used by hosts to decide how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input or package contents, rejected before any state changes.
    Validation,
    /// The user, the host or the registry said no.
    Authorization,
    /// A caller broke an invariant (double start, missing snapshot, unbalanced references).
    Contract,
    Timeout,
    Transport,
    /// The snap itself failed.
    Execution,
    NotFound,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapError {
    #[error("Snap \"{0}\" not found.")]
    NotFound(SnapId),
    #[error(transparent)]
    InvalidId(#[from] SnapIdError),
    #[error("The \"version\" field must be a valid SemVer version range if specified. Received: \"{}\".", .0.range)]
    InvalidVersion(#[from] VersionRangeError),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Permissions(#[from] PermissionError),
    #[error("Snap \"{0}\" is disabled.")]
    Disabled(SnapId),
    #[error("Snap \"{0}\" is currently being installed. Please try again later.")]
    Installing(SnapId),
    #[error("Snap \"{0}\" is blocked and cannot be enabled.")]
    BlockedEnable(SnapId),
    #[error("{0}")]
    Registry(String),
    #[error("Snap \"{snap_id}\" is not permitted to use \"{handler}\".")]
    NotPermitted { snap_id: SnapId, handler: String },
    #[error("Snap \"{snap_id}\" is not permitted to handle requests from \"{origin}\".")]
    OriginNotAllowed { snap_id: SnapId, origin: String },
    #[error(transparent)]
    Approval(#[from] HostError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("{0} failed to respond to the request in time.")]
    RequestTimeout(SnapId),
    #[error("{0} failed to start in time.")]
    StartTimeout(SnapId),
    #[error("Snap {0} crashed with updated source code.")]
    CrashedOnUpdate(SnapId),
    #[error(transparent)]
    Lifecycle(#[from] FsmError),
    #[error("{0}")]
    Contract(String),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error("state store: {0}")]
    Store(String),
}

impl SnapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapError::NotFound(_) => ErrorKind::NotFound,
            SnapError::InvalidId(_)
            | SnapError::InvalidVersion(_)
            | SnapError::Validation(_)
            | SnapError::Permissions(_)
            | SnapError::Location(LocationError::InvalidManifest(_)) => ErrorKind::Validation,
            SnapError::Location(LocationError::Fetch(_)) => ErrorKind::Transport,
            SnapError::Location(_) => ErrorKind::NotFound,
            SnapError::Disabled(_)
            | SnapError::BlockedEnable(_)
            | SnapError::Registry(_)
            | SnapError::NotPermitted { .. }
            | SnapError::OriginNotAllowed { .. }
            | SnapError::Approval(_) => ErrorKind::Authorization,
            SnapError::Installing(_)
            | SnapError::Queue(_)
            | SnapError::Lifecycle(_)
            | SnapError::Contract(_) => ErrorKind::Contract,
            SnapError::RequestTimeout(_) | SnapError::StartTimeout(_) => ErrorKind::Timeout,
            SnapError::CrashedOnUpdate(_) => ErrorKind::Execution,
            SnapError::Execution(err) => err.kind(),
            SnapError::Store(_) => ErrorKind::Transport,
        }
    }

    pub(crate) fn contract(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(target: "snaps::controller", %message, "contract violation");
        SnapError::Contract(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> SnapId {
        SnapId::parse("npm:example").expect("id")
    }

    #[test]
    fn messages_name_the_snap() {
        assert_eq!(
            SnapError::Disabled(id()).to_string(),
            "Snap \"npm:example\" is disabled."
        );
        assert_eq!(
            SnapError::RequestTimeout(id()).to_string(),
            "npm:example failed to respond to the request in time."
        );
        assert_eq!(
            SnapError::CrashedOnUpdate(id()).to_string(),
            "Snap npm:example crashed with updated source code."
        );
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(SnapError::NotFound(id()).kind(), ErrorKind::NotFound);
        assert_eq!(SnapError::RequestTimeout(id()).kind(), ErrorKind::Timeout);
        assert_eq!(
            SnapError::Approval(HostError::Rejected).kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            SnapError::Queue(QueueError::Full {
                origin: "o".into(),
                max: 5
            })
            .kind(),
            ErrorKind::Contract
        );
        assert_eq!(
            SnapError::Execution(ExecutionError::NotFound("job".into())).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn invalid_version_message_quotes_input() {
        let err = snaps_core::version::resolve_version_range(Some("nope")).expect_err("invalid");
        assert_eq!(
            SnapError::from(err).to_string(),
            "The \"version\" field must be a valid SemVer version range if specified. Received: \"nope\"."
        );
    }
}
