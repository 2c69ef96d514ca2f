//! Use Case / Handler (spec.md §4.8): one command type maps to one
//! handler, each a pure function of `(command, docker, fleet,
//! build_state)`. Handlers must be idempotent under at-least-once
//! delivery — re-running on a partially-applied prior attempt converges
//! rather than double-applying.
//!
//! Grounded on Komodo's resolver-per-mutation pattern
//! (`bin/core/src/api/execute/docker/container.rs`): each resolver is a
//! thin translation from one typed request into Docker Service calls,
//! with no handler-local retry logic (retries are the Command
//! Controller's job, not the handler's).

use std::collections::HashMap;

use async_trait::async_trait;
use genesis_build_state::{BuildState, Command, GenesisError, GenesisErrorKind};
use genesis_docker::DockerService;
use genesis_fleet::Fleet;
use genesis_registrar::Registry;
use serde::Deserialize;

#[async_trait]
pub trait CommandHandler: Send + Sync {
  async fn handle(
    &self,
    command: &Command,
    docker: &DockerService,
    fleet: &Fleet,
    build_state: &BuildState,
  ) -> Result<(), GenesisError>;
}

/// `{type: "build", payload: {protocol: str}}`: looks the protocol up in
/// the Registrar and runs its `build` to completion.
pub struct BuildHandler {
  registry: std::sync::Arc<Registry>,
}

impl BuildHandler {
  pub fn new(registry: std::sync::Arc<Registry>) -> Self {
    BuildHandler { registry }
  }
}

#[derive(Deserialize)]
struct BuildPayload {
  protocol: String,
}

#[async_trait]
impl CommandHandler for BuildHandler {
  async fn handle(
    &self,
    command: &Command,
    _docker: &DockerService,
    fleet: &Fleet,
    build_state: &BuildState,
  ) -> Result<(), GenesisError> {
    let payload: BuildPayload = serde_json::from_value(command.payload.clone()).map_err(|e| {
      GenesisError::with_source(GenesisErrorKind::Poisoned, "malformed build payload", e.into())
    })?;
    let builder = self.registry.lookup(&payload.protocol).ok_or_else(|| {
      GenesisError::not_found(format!("no protocol registered as {}", payload.protocol))
    })?;
    builder.build(fleet, build_state).await
  }
}

/// Dispatch table built once at controller startup (closed set, unlike
/// the Registrar's open one): one `CommandHandler` per `Command.type`.
pub struct HandlerTable {
  handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
}

impl HandlerTable {
  pub fn new() -> Self {
    HandlerTable { handlers: HashMap::new() }
  }

  pub fn register(mut self, command_type: &'static str, handler: Box<dyn CommandHandler>) -> Self {
    self.handlers.insert(command_type, handler);
    self
  }

  pub fn get(&self, command_type: &str) -> Option<&dyn CommandHandler> {
    self.handlers.get(command_type).map(|h| h.as_ref())
  }
}

impl Default for HandlerTable {
  fn default() -> Self {
    Self::new()
  }
}
