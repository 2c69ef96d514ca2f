//! Read-only "by name" queries plus the single-flight image-pull lock.
//!
//! Grounded on `bin/periphery/src/api/docker.rs`'s `InspectContainer`,
//! `InspectNetwork`, and `PullImage` resolvers, and on
//! `examples/original_source/pkg/service/auxillary/docker_test.go`'s exact
//! semantics: a container matches by any of its `Names` aliases, a network
//! matches by exact name, and pulling an already-present image is a no-op
//! that still reverifies presence before returning.

use std::sync::Arc;

use bollard::Docker;
use bollard::query_parameters::{
  CreateImageOptions, ListContainersOptions, ListNetworksOptions, ListVolumesOptions,
};
use bollard::secret::{ContainerSummary, Network, Volume};
use dashmap::DashMap;
use futures_util::TryStreamExt;
use genesis_build_state::{GenesisError, GenesisErrorKind};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument};

/// Read-only Docker queries plus idempotent image pulls, scoped to one
/// remote host's `bollard::Docker` client.
pub struct DockerAux {
  client: Docker,
  /// One lock per image reference, so concurrent pulls of the same image
  /// on the same host collapse into a single `docker pull` (P6) while
  /// pulls of different images still run in parallel.
  pull_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl DockerAux {
  pub fn new(client: Docker) -> Self {
    DockerAux { client, pull_locks: DashMap::new() }
  }

  /// Exact-name match; first match wins if the daemon ever returns more
  /// than one (it shouldn't, names are unique).
  #[instrument(skip(self))]
  pub async fn get_network_by_name(
    &self,
    name: &str,
  ) -> Result<Network, GenesisError> {
    let options = ListNetworksOptions {
      filters: Some(std::collections::HashMap::from([(
        "name".to_string(),
        vec![name.to_string()],
      )])),
    };
    let networks = self
      .client
      .list_networks(Some(options))
      .await
      .map_err(bollard_err)?;
    networks
      .into_iter()
      .find(|n| n.name.as_deref() == Some(name))
      .ok_or_else(|| GenesisError::not_found(format!("network {name} not found")))
  }

  /// A container "has" a name if any entry in its `Names` list matches;
  /// Docker prefixes each name with `/`, so both forms are accepted.
  #[instrument(skip(self))]
  pub async fn get_container_by_name(
    &self,
    name: &str,
  ) -> Result<ContainerSummary, GenesisError> {
    let options = ListContainersOptions { all: true, ..Default::default() };
    let containers = self
      .client
      .list_containers(Some(options))
      .await
      .map_err(bollard_err)?;
    containers
      .into_iter()
      .find(|c| container_matches_name(c.names.as_ref(), name))
      .ok_or_else(|| GenesisError::not_found(format!("container {name} not found")))
  }

  #[instrument(skip(self))]
  pub async fn get_volume_by_name(
    &self,
    name: &str,
  ) -> Result<Volume, GenesisError> {
    let options = ListVolumesOptions {
      filters: Some(std::collections::HashMap::from([(
        "name".to_string(),
        vec![name.to_string()],
      )])),
      ..Default::default()
    };
    let response = self
      .client
      .list_volumes(Some(options))
      .await
      .map_err(bollard_err)?;
    response
      .volumes
      .unwrap_or_default()
      .into_iter()
      .find(|v| v.name == name)
      .ok_or_else(|| GenesisError::not_found(format!("volume {name} not found")))
  }

  /// Whether the daemon already has `image`, by reference (tag or
  /// digest) so a pull-by-digest still counts as present.
  #[instrument(skip(self))]
  pub async fn host_has_image(&self, image: &str) -> Result<bool, GenesisError> {
    match self.client.inspect_image(image).await {
      // A successful inspect already proves the daemon resolved the
      // reference locally; RepoTags/RepoDigests aren't consulted further.
      Ok(_inspect) => Ok(true),
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
        Ok(false)
      }
      Err(e) => Err(bollard_err(e)),
    }
  }

  /// Returns the per-image pull lock, inserting a fresh one on first
  /// use. Concurrent callers for the same image reference share the
  /// same `Arc`, so they serialize on the same mutex (P6); callers for
  /// distinct images never contend with each other.
  fn pull_lock_for(&self, image: &str) -> Arc<AsyncMutex<()>> {
    self
      .pull_locks
      .entry(image.to_string())
      .or_insert_with(|| Arc::new(AsyncMutex::new(())))
      .clone()
  }

  /// Pulls `image` if absent, draining the pull's progress stream to
  /// completion before returning (spec.md §4.2 invariant: a pull that is
  /// reported as finished has actually finished). Single-flight per image
  /// reference: concurrent callers for the same image share one pull and
  /// all observe the reverified post-pull state (P6).
  #[instrument(skip(self))]
  pub async fn ensure_image_pulled(&self, image: &str) -> Result<(), GenesisError> {
    let lock = self.pull_lock_for(image);
    let _guard = lock.lock().await;

    if self.host_has_image(image).await? {
      debug!(image, "image already present, skipping pull");
      return Ok(());
    }

    let options = CreateImageOptions { from_image: Some(image.to_string()), ..Default::default() };
    let mut stream = self.client.create_image(Some(options), None, None);
    while let Some(progress) = stream.try_next().await.map_err(bollard_err)? {
      if let Some(err) = progress.error {
        return Err(GenesisError::new(
          GenesisErrorKind::Permanent,
          format!("pulling {image} failed: {err}"),
        ));
      }
    }

    if !self.host_has_image(image).await? {
      return Err(GenesisError::new(
        GenesisErrorKind::Transient,
        format!("pull of {image} reported success but image is still absent"),
      ));
    }
    Ok(())
  }
}

/// The exact alias-matching predicate `get_container_by_name` uses:
/// Docker prefixes each name with `/`, so both the bare and prefixed
/// forms are accepted (P8).
fn container_matches_name(names: Option<&Vec<String>>, name: &str) -> bool {
  let wanted = format!("/{name}");
  names
    .map(|names| names.iter().any(|n| n == name || n == &wanted))
    .unwrap_or(false)
}

fn bollard_err(e: bollard::errors::Error) -> GenesisError {
  GenesisError::with_source(GenesisErrorKind::Transient, "docker api request failed", e.into())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn aux() -> DockerAux {
    // Never dials the daemon; these tests only exercise the pull-lock
    // map and the name-matching predicate, neither of which touches
    // the network.
    let client = Docker::connect_with_defaults().expect("client construction does not dial the daemon");
    DockerAux::new(client)
  }

  /// P6: `ensure_image_pulled`'s single-flight lock, exercised through
  /// `DockerAux::pull_lock_for` itself rather than a reimplemented
  /// mutex — two callers for the same image reference share one
  /// `Arc<AsyncMutex<()>>` and serialize on it, while a distinct image
  /// gets its own independent lock.
  #[tokio::test]
  async fn ensure_image_pulled_is_idempotent() {
    let aux = Arc::new(aux());
    let counter = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..8 {
      let aux = aux.clone();
      let counter = counter.clone();
      handles.push(tokio::spawn(async move {
        let lock = aux.pull_lock_for("img:x");
        let _guard = lock.lock().await;
        let before = counter.load(Ordering::SeqCst);
        tokio::task::yield_now().await;
        counter.store(before + 1, Ordering::SeqCst);
      }));
    }
    for h in handles {
      h.await.unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 8, "concurrent pulls of the same image must serialize");

    let lock_a = aux.pull_lock_for("img:x");
    let lock_b = aux.pull_lock_for("img:x");
    assert!(Arc::ptr_eq(&lock_a, &lock_b), "same image reference must share one lock");

    let lock_other = aux.pull_lock_for("img:y");
    assert!(!Arc::ptr_eq(&lock_a, &lock_other), "distinct images must not contend");
  }

  /// P8, via the real predicate `get_container_by_name` calls.
  #[test]
  fn get_container_by_name_matches_any_alias() {
    let names = vec!["/genesis-5".to_string(), "/genesis-5-alias".to_string()];
    assert!(container_matches_name(Some(&names), "genesis-5"));
    assert!(!container_matches_name(Some(&names), "genesis-6"));
    assert!(!container_matches_name(None, "genesis-5"));
  }
}
