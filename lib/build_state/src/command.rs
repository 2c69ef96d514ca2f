use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GenesisError;

/// Immutable inbound command envelope (spec.md §3, §6). Identity is
/// `(id, attempt)` — a redelivered message with a bumped `attempt` is a
/// distinct identity for dedup purposes, but the same logical command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
  pub id: String,
  #[serde(rename = "type")]
  pub command_type: String,
  pub payload: Value,
  pub attempt: u32,
  pub max_attempts: u32,
  pub deadline: DateTime<Utc>,
}

impl Command {
  pub fn identity(&self) -> (String, u32) {
    (self.id.clone(), self.attempt)
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now > self.deadline
  }

  pub fn next_attempt(&self) -> Command {
    Command { attempt: self.attempt + 1, ..self.clone() }
  }

  pub fn attempts_exhausted(&self) -> bool {
    self.attempt >= self.max_attempts
  }
}

/// Parses a raw inbound payload into a [`Command`], classifying any
/// failure as `Poisoned` (spec.md §4.7 malformed branch).
pub fn parse_command(bytes: &[u8]) -> Result<Command, GenesisError> {
  serde_json::from_slice(bytes).map_err(|e| {
    GenesisError::poisoned(format!(
      "malformed command envelope: {e}"
    ))
  })
}

/// `{id, result, ext}` completion envelope (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEnvelope {
  pub id: String,
  pub result: Value,
  pub ext: Value,
}

/// `{id, completed_steps, total_steps, stage}` progress envelope
/// (spec.md §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEnvelope {
  pub id: String,
  pub completed_steps: u64,
  pub total_steps: u64,
  pub stage: String,
}
