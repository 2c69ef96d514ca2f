use std::path::PathBuf;
use std::time::Duration;

use bollard::Docker;
use dashmap::DashMap;
use genesis_build_state::{GenesisError, GenesisErrorKind};

/// `DOCKER_*` connection parameters for one remote host (spec.md §6).
#[derive(Debug, Clone)]
pub struct DockerEndpoint {
  /// e.g. `tcp://10.0.0.5:2376`.
  pub url: String,
  pub ca_cert: Option<PathBuf>,
  pub client_cert: Option<PathBuf>,
  pub client_key: Option<PathBuf>,
}

impl DockerEndpoint {
  pub fn insecure(url: impl Into<String>) -> Self {
    DockerEndpoint {
      url: url.into(),
      ca_cert: None,
      client_cert: None,
      client_key: None,
    }
  }
}

const CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

/// One `bollard::Docker` client per remote host, keyed by server
/// address, opened lazily on first use.
#[derive(Default)]
pub struct DockerHostPool {
  clients: DashMap<String, Docker>,
}

impl DockerHostPool {
  pub fn new() -> Self {
    DockerHostPool::default()
  }

  pub fn get_or_connect(
    &self,
    server_key: &str,
    endpoint: &DockerEndpoint,
  ) -> Result<Docker, GenesisError> {
    if let Some(existing) = self.clients.get(server_key) {
      return Ok(existing.clone());
    }
    let client = Self::connect(endpoint)?;
    self.clients.insert(server_key.to_string(), client.clone());
    Ok(client)
  }

  fn connect(endpoint: &DockerEndpoint) -> Result<Docker, GenesisError> {
    let timeout = CLIENT_TIMEOUT.as_secs();
    let client = match (&endpoint.ca_cert, &endpoint.client_cert, &endpoint.client_key) {
      (Some(ca), Some(cert), Some(key)) => Docker::connect_with_ssl(
        &endpoint.url,
        key,
        cert,
        ca,
        timeout,
        bollard::API_DEFAULT_VERSION,
      ),
      _ => Docker::connect_with_http(
        &endpoint.url,
        timeout,
        bollard::API_DEFAULT_VERSION,
      ),
    };
    client.map_err(|e| {
      GenesisError::with_source(
        GenesisErrorKind::Config,
        format!("failed to connect to Docker endpoint {}", endpoint.url),
        e.into(),
      )
    })
  }

  pub fn remove(&self, server_key: &str) {
    self.clients.remove(server_key);
  }
}
