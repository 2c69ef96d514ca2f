use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds from spec.md §7. This is a closed set on purpose: the
/// Command Controller's retry/terminal classification switches on it
/// exhaustively, so adding a kind without updating every match site is a
/// compile error.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "PascalCase")]
pub enum GenesisErrorKind {
  Config,
  NotFound,
  Conflict,
  Transient,
  Permanent,
  Timeout,
  Cancelled,
  /// Malformed inbound command (spec.md §4.7 `POISONED`).
  Poisoned,
}

impl GenesisErrorKind {
  /// Whether the Command Controller should schedule a retry for an
  /// error of this kind (spec.md §4.7, §7).
  pub fn is_retryable(self) -> bool {
    matches!(self, GenesisErrorKind::Transient | GenesisErrorKind::Timeout)
  }
}

/// The error type threaded through Remote Shell, Docker Service,
/// BuildState, and the Command Controller. Carries a [`GenesisErrorKind`]
/// alongside the usual message/source chain so handlers can classify
/// without downcasting.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct GenesisError {
  pub kind: GenesisErrorKind,
  pub message: String,
  #[source]
  source: Option<anyhow::Error>,
}

impl GenesisError {
  pub fn new(
    kind: GenesisErrorKind,
    message: impl Into<String>,
  ) -> Self {
    GenesisError { kind, message: message.into(), source: None }
  }

  pub fn with_source(
    kind: GenesisErrorKind,
    message: impl Into<String>,
    source: anyhow::Error,
  ) -> Self {
    GenesisError {
      kind,
      message: message.into(),
      source: Some(source),
    }
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::new(GenesisErrorKind::NotFound, message)
  }

  pub fn conflict(message: impl Into<String>) -> Self {
    Self::new(GenesisErrorKind::Conflict, message)
  }

  pub fn transient(message: impl Into<String>) -> Self {
    Self::new(GenesisErrorKind::Transient, message)
  }

  pub fn permanent(message: impl Into<String>) -> Self {
    Self::new(GenesisErrorKind::Permanent, message)
  }

  pub fn cancelled() -> Self {
    Self::new(GenesisErrorKind::Cancelled, "operation was cancelled")
  }

  pub fn poisoned(message: impl Into<String>) -> Self {
    Self::new(GenesisErrorKind::Poisoned, message)
  }
}

/// Wire shape for an error envelope (spec.md §6): `{id, kind, message,
/// attempt}`. Produced at the Command Controller boundary, not carried
/// internally (internal code passes [`GenesisError`] itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
  pub id: String,
  pub kind: GenesisErrorKind,
  pub message: String,
  pub attempt: u32,
}

impl ErrorEnvelope {
  pub fn new(id: impl Into<String>, attempt: u32, err: &GenesisError) -> Self {
    ErrorEnvelope {
      id: id.into(),
      kind: err.kind,
      message: err.message.clone(),
      attempt,
    }
  }
}
