//! REST Controller (spec.md §4.1 ambient / §6): a single synchronous
//! `POST /command` endpoint mirroring the AMQP command path, for
//! `LOCAL_MODE` deployments that have no broker.
//!
//! Grounded on the teacher's `axum::Router` conventions
//! (`bin/core/src/api/mod.rs`'s router construction) — one `Router`,
//! `Json` extractors in, `Json` responses out.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use genesis_build_state::{BuildState, Command, ErrorEnvelope};
use genesis_docker::DockerService;
use genesis_fleet::Fleet;
use serde_json::Value;

use crate::controller::CommandController;

pub struct RestState {
  pub controller: Arc<CommandController>,
  pub docker: Arc<DockerService>,
  pub fleet: Arc<Fleet>,
}

pub fn router(state: Arc<RestState>) -> Router {
  Router::new().route("/command", post(handle_command)).with_state(state)
}

async fn handle_command(
  State(state): State<Arc<RestState>>,
  Json(command): Json<Command>,
) -> impl IntoResponse {
  let build_state = BuildState::new();
  match state
    .controller
    .dispatch(command.clone(), state.docker.clone(), state.fleet.clone(), &build_state)
    .await
  {
    Ok(()) => {
      let body: Value = serde_json::json!({
        "id": command.id,
        "result": {},
        "ext": build_state.ext_snapshot().await,
      });
      (StatusCode::OK, Json(body)).into_response()
    }
    Err(err) => {
      let envelope = ErrorEnvelope::new(command.id, command.attempt, &err);
      (StatusCode::UNPROCESSABLE_ENTITY, Json(envelope)).into_response()
    }
  }
}
