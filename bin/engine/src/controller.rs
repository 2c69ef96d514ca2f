//! Command Controller (spec.md §4.7): drives one inbound command
//! through RECEIVED → IN_FLIGHT → {COMPLETED, RETRY_SCHEDULED → RECEIVED,
//! FAILED, POISONED}, publishing terminal status only after an attempt
//! is fully resolved.
//!
//! Grounded on `original_source/main.go`'s four-queue wiring (one
//! `QueueHandle` per logical queue) and on spec.md §4.7's retry
//! contract; the classification switch itself lives here rather than in
//! `genesis_build_state` because only the controller knows about
//! `max_message_retries` and the queue topology.

use std::sync::Arc;

use genesis_build_state::{BuildState, Command, CompletionEnvelope, ErrorEnvelope, GenesisError};
use genesis_docker::DockerService;
use genesis_fleet::Fleet;
use genesis_queue::QueueHandle;
use tracing::{info, instrument, warn};

use crate::handler::HandlerTable;

pub struct CommandController {
  handlers: HandlerTable,
  completion_queue: QueueHandle,
  error_queue: QueueHandle,
  status_queue: QueueHandle,
  max_message_retries: u32,
}

impl CommandController {
  pub fn new(
    handlers: HandlerTable,
    completion_queue: QueueHandle,
    error_queue: QueueHandle,
    status_queue: QueueHandle,
    max_message_retries: u32,
  ) -> Self {
    CommandController {
      handlers,
      completion_queue,
      error_queue,
      status_queue,
      max_message_retries,
    }
  }

  /// Runs one command to a terminal state, publishing the matching
  /// envelope before returning. A malformed command never reaches here
  /// (classified POISONED by the queue layer before parsing succeeds);
  /// this entry point only sees commands that parsed.
  #[instrument(skip(self, command, docker, fleet, build_state), fields(id = %command.id, attempt = command.attempt))]
  pub async fn dispatch(
    &self,
    command: Command,
    docker: Arc<DockerService>,
    fleet: Arc<Fleet>,
    build_state: &BuildState,
  ) -> Result<(), GenesisError> {
    let Some(handler) = self.handlers.get(&command.command_type) else {
      let err = GenesisError::permanent(format!("no handler for command type {}", command.command_type));
      self.publish_error(&command, &err).await;
      return Err(err);
    };

    if command.is_expired(chrono::Utc::now()) {
      let err = GenesisError::new(
        genesis_build_state::GenesisErrorKind::Timeout,
        "command deadline exceeded",
      );
      build_state.report(GenesisError::new(err.kind, err.message.clone())).await;
      build_state.finish().await;
      self.publish_error(&command, &err).await;
      return Err(err);
    }

    match handler.handle(&command, &docker, &fleet, build_state).await {
      Ok(()) => {
        build_state.finish().await;
        let envelope = CompletionEnvelope {
          id: command.id.clone(),
          result: serde_json::json!({}),
          ext: build_state.ext_snapshot().await,
        };
        if let Err(e) = self.completion_queue.publish_completion(&envelope).await {
          warn!("failed to publish completion envelope: {}", e.message);
        }
        info!("command completed");
        Ok(())
      }
      Err(err) => self.handle_failure(command, build_state, err).await,
    }
  }

  async fn handle_failure(
    &self,
    command: Command,
    build_state: &BuildState,
    err: GenesisError,
  ) -> Result<(), GenesisError> {
    build_state.report(GenesisError::new(err.kind, err.message.clone())).await;
    let retryable = err.kind.is_retryable()
      && command.attempt < self.max_message_retries
      && command.attempt < command.max_attempts;

    if retryable {
      info!(attempt = command.attempt, "scheduling retry");
      return Err(err);
    }

    build_state.finish().await;
    self.publish_error(&command, &err).await;
    Err(err)
  }

  async fn publish_error(&self, command: &Command, err: &GenesisError) {
    let envelope = ErrorEnvelope::new(command.id.clone(), command.attempt, err);
    if let Err(e) = self.error_queue.publish_error(&envelope).await {
      warn!("failed to publish error envelope: {}", e.message);
    }
  }

  pub async fn publish_status(&self, envelope: &genesis_build_state::StatusEnvelope) {
    if let Err(e) = self.status_queue.publish_status(envelope).await {
      warn!("failed to publish status envelope: {}", e.message);
    }
  }

  /// §4.7 `POISONED` transition: a command that never parsed has no
  /// `id`/`attempt` to key an envelope by, so both are synthesized
  /// (spec.md §6 doesn't reserve a sentinel id for this case). No
  /// handler ever runs for these.
  pub async fn publish_poisoned(&self, err: &GenesisError) {
    let envelope = ErrorEnvelope::new("unknown", 0, err);
    if let Err(e) = self.error_queue.publish_error(&envelope).await {
      warn!("failed to publish poisoned-command error envelope: {}", e.message);
    }
  }
}
