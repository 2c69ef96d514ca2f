//! Executor / Fan-out (spec.md §4.5): run one closure per node in a
//! fleet, in parallel, joining every worker before returning (P4).
//!
//! Workers are not cancelled on a sibling's failure — cancellation is
//! cooperative, observed only by a worker that has not yet started
//! (spec.md §5 "in-flight blocking calls run to their own natural
//! completion"). Ordering between nodes is never implied; a caller that
//! needs cross-node ordering sequences two `all_nodes` calls.

use std::future::Future;
use std::sync::Arc;

use genesis_build_state::{BuildState, GenesisError};
use genesis_fleet::{Fleet, NodeRef};
use tokio::task::JoinSet;
use tracing::warn;

/// Runs `f(node)` for every node in the fleet, concurrently across the
/// whole fleet (not just within one host). Returns the first error
/// observed, or `Ok(())` if every worker succeeded.
pub async fn all_nodes<F, Fut>(
  fleet: &Fleet,
  build_state: &BuildState,
  f: F,
) -> Result<(), GenesisError>
where
  F: Fn(NodeRef) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), GenesisError>> + Send + 'static,
{
  let f = Arc::new(f);
  let mut set = JoinSet::new();
  for node in fleet.nodes() {
    let f = f.clone();
    let cancel = build_state.cancellation_token();
    set.spawn(async move {
      // Suspension point: a worker that hasn't started yet honours
      // cancellation instead of beginning new work (spec.md §5).
      if cancel.is_cancelled() {
        return Err(GenesisError::cancelled());
      }
      f(node).await
    });
  }

  let mut first_err: Option<GenesisError> = None;
  while let Some(joined) = set.join_next().await {
    let result = match joined {
      Ok(result) => result,
      Err(join_err) => Err(GenesisError::permanent(format!(
        "node worker task panicked: {join_err}"
      ))),
    };
    if let Err(e) = result {
      if first_err.is_none() {
        build_state
          .report(GenesisError::new(e.kind, e.message.clone()))
          .await;
        first_err = Some(e);
      } else {
        warn!(
          "additional node worker failure after first error: {}",
          e.message
        );
      }
    }
  }

  match first_err {
    Some(e) => Err(e),
    None => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use genesis_fleet::{Fleet, ServerHandle, SshTarget};
  use std::net::IpAddr;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn fleet(servers: usize, nodes_per_server: usize) -> Fleet {
    let handles = (0..servers)
      .map(|i| ServerHandle {
        index: i,
        ssh: SshTarget {
          host: format!("host{i}"),
          port: 22,
          user: "root".into(),
          key_path: "/dev/null".into(),
        },
        ip_pool: (0..nodes_per_server)
          .map(|n| IpAddr::from([10, 0, i as u8, n as u8]))
          .collect(),
      })
      .collect();
    Fleet::new(handles, vec![nodes_per_server; servers])
  }

  #[tokio::test]
  async fn all_nodes_runs_every_node_despite_failures() {
    let fleet = fleet(2, 2);
    let state = BuildState::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen2 = seen.clone();

    let result = all_nodes(&fleet, &state, move |node| {
      let seen = seen2.clone();
      async move {
        seen.lock().unwrap().push(node.absolute_number);
        if node.absolute_number == 2 {
          return Err(GenesisError::permanent("boom"));
        }
        Ok(())
      }
    })
    .await;

    assert!(result.is_err());
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2, 3], "every node must be visited");
    assert!(state.failed().await);
  }

  #[tokio::test]
  async fn all_nodes_succeeds_when_every_worker_succeeds() {
    let fleet = fleet(1, 3);
    let state = BuildState::new();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();

    let result = all_nodes(&fleet, &state, move |_node| {
      let count = count2.clone();
      async move {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    })
    .await;

    assert!(result.is_ok());
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert!(!state.failed().await);
  }
}
