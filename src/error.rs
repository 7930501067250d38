use thiserror::Error;

use crate::model::NotificationState;

/// Failure while expanding an audience. Nothing has been committed when this
/// is returned, so the notification stays in `Draft`.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("roster source unavailable: {0}")]
    RosterUnavailable(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("notification {0} not found")]
    NotFound(String),
    #[error("notification {id} already started (state {})", state.as_str())]
    AlreadyStarted {
        id: String,
        state: NotificationState,
    },
    #[error("notification {id} cannot be cancelled in state {}", state.as_str())]
    NotCancellable {
        id: String,
        state: NotificationState,
    },
    #[error("invalid draft: {0}")]
    InvalidDraft(&'static str),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
