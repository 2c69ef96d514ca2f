//! CLI wrapper (spec.md §6): `genesis test` and `genesis clean` exercise
//! the Docker Service round-trip against the local host and exit.
//!
//! Direct Rust rendering of `original_source/main.go`'s
//! `os.Args[1] == "test" | "clean"` branch and its `dockerTest(clean
//! bool)` helper: create a network and a container, start and stop it,
//! then tear both down. `clean` skips the create/start/stop steps and
//! only tears down anything a prior `test` run left behind.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use genesis_docker::{DockerEndpoint, DockerHostPool, DockerService};
use genesis_fleet::{ContainerSpec, NetworkSpec};
use serde::Deserialize;
use tracing::{error, info};

const TEST_NETWORK: &str = "genesis-cli-test-net";
const TEST_CONTAINER: &str = "genesis-cli-test-container";
const TEST_IMAGE: &str = "hello-world";

#[derive(Parser, Debug)]
#[command(name = "genesis")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create a network and container on the local Docker host, start and
  /// stop the container, then remove both.
  Test,
  /// Remove the network and container a prior `test` run may have left
  /// behind; never fails if they are already gone.
  Clean,
}

#[derive(Deserialize, Debug, Default)]
struct DockerEnv {
  docker_endpoint: Option<String>,
  docker_ca_cert: Option<PathBuf>,
  docker_client_cert: Option<PathBuf>,
  docker_client_key: Option<PathBuf>,
}

fn load_endpoint() -> anyhow::Result<DockerEndpoint> {
  dotenvy::dotenv().ok();
  let env: DockerEnv = envy::prefixed("GENESIS_").from_env()?;
  Ok(DockerEndpoint {
    url: env.docker_endpoint.unwrap_or_else(|| "unix:///var/run/docker.sock".to_string()),
    ca_cert: env.docker_ca_cert,
    client_cert: env.docker_client_cert,
    client_key: env.docker_client_key,
  })
}

fn test_container_spec() -> ContainerSpec {
  ContainerSpec {
    name: TEST_CONTAINER.to_string(),
    image: TEST_IMAGE.to_string(),
    env: HashMap::new(),
    command: Vec::new(),
    mounts: Vec::new(),
    networks: vec![TEST_NETWORK.to_string()],
    cpus: None,
    memory_bytes: None,
    ports: Vec::new(),
    entrypoint: None,
    labels: HashMap::new(),
  }
}

fn test_network_spec() -> NetworkSpec {
  NetworkSpec {
    name: TEST_NETWORK.to_string(),
    subnet_cidr: "172.31.255.0/24".to_string(),
    gateway: "172.31.255.1".to_string(),
    driver: "bridge".to_string(),
    labels: HashMap::new(),
  }
}

async fn run_test(docker: &DockerService) -> anyhow::Result<()> {
  docker.create_network(&test_network_spec()).await?;
  info!(network = TEST_NETWORK, "network created");

  let build_state = genesis_build_state::BuildState::new();
  docker.create_container(&build_state, &test_container_spec()).await?;
  info!(container = TEST_CONTAINER, "container created");

  docker.start_container(TEST_CONTAINER).await?;
  info!(container = TEST_CONTAINER, "container started");

  docker.stop_container(TEST_CONTAINER, 10).await?;
  info!(container = TEST_CONTAINER, "container stopped");

  docker.remove_container(TEST_CONTAINER, true).await?;
  docker.remove_network(TEST_NETWORK).await?;
  info!("test resources removed");
  Ok(())
}

async fn run_clean(docker: &DockerService) -> anyhow::Result<()> {
  docker.remove_container(TEST_CONTAINER, true).await?;
  docker.remove_network(TEST_NETWORK).await?;
  info!("clean complete");
  Ok(())
}

fn main() -> ExitCode {
  tracing_subscriber::fmt().init();

  let cli = Cli::parse();
  let endpoint = match load_endpoint() {
    Ok(e) => e,
    Err(e) => {
      error!("configuration error: {e}");
      return ExitCode::from(1);
    }
  };

  let runtime = match tokio::runtime::Runtime::new() {
    Ok(rt) => rt,
    Err(e) => {
      error!("failed to start async runtime: {e}");
      return ExitCode::from(2);
    }
  };

  runtime.block_on(async move {
    let pool = DockerHostPool::new();
    let client = match pool.get_or_connect("local", &endpoint) {
      Ok(c) => c,
      Err(e) => {
        error!("configuration error: {e}");
        return ExitCode::from(1);
      }
    };
    let docker = DockerService::new(client);

    let result = match cli.command {
      Command::Test => run_test(&docker).await,
      Command::Clean => run_clean(&docker).await,
    };

    match result {
      Ok(()) => ExitCode::from(0),
      Err(e) => {
        error!("runtime error: {e}");
        ExitCode::from(2)
      }
    }
  })
}
