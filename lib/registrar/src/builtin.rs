//! The one protocol shipped in this crate: a builder that exercises the
//! contract end to end without any real blockchain semantics
//! (spec.md §8 scenario 1). Every other protocol (Parity PoA,
//! geth/ethclassic, EOS, Orion, ...) is an external collaborator per
//! spec.md §1's Non-goals.

use async_trait::async_trait;
use genesis_build_state::{BuildState, GenesisError};
use genesis_executor::all_nodes;
use genesis_fleet::Fleet;
use serde_json::json;

use crate::ProtocolBuilder;

/// Increments one step per node, then writes `ext["ok"] = true`.
pub struct NoopBuilder;

#[async_trait]
impl ProtocolBuilder for NoopBuilder {
  async fn build(
    &self,
    fleet: &Fleet,
    build_state: &BuildState,
  ) -> Result<(), GenesisError> {
    build_state.set_build_steps(fleet.node_count() as u64).await;
    build_state.set_build_stage("provisioning").await;

    let progress_state = build_state.clone();
    all_nodes(fleet, build_state, move |_node| {
      let build_state = progress_state.clone();
      async move {
        build_state.increment_build_progress().await;
        Ok(())
      }
    })
    .await?;

    build_state.set_ext("ok", json!(true)).await;
    Ok(())
  }
}
