use std::sync::Arc;

use genesis_build_state::BuildState;
use genesis_docker::{DockerEndpoint, DockerHostPool, DockerService};
use genesis_engine::config::config;
use genesis_engine::controller::CommandController;
use genesis_engine::handler::{BuildHandler, HandlerTable};
use genesis_engine::rest::{self, RestState};
use genesis_fleet::Fleet;
use genesis_queue::{connect_with_retry, next_command, QueueConfig, QueueSet};
use genesis_registrar::builtin::NoopBuilder;
use genesis_registrar::Registry;
use tracing::{error, info};

fn init_tracing() {
  let filter = if config().debug_mode { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
    .init();
}

fn queue_set() -> QueueSet {
  let cfg = config();
  let base = |queue: &str, routing_key: &str| QueueConfig {
    endpoint: cfg.amqp_endpoint.clone(),
    exchange: cfg.amqp_exchange.clone(),
    routing_key: routing_key.to_string(),
    queue: queue.to_string(),
  };
  QueueSet {
    cmd: base("cmd", "cmd"),
    completion: base("completion", "completion"),
    errors: base("errors", "errors"),
    status: base("status", "status"),
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let cfg = config();

  let registry = Arc::new(Registry::new());
  registry.register("noop", Arc::new(NoopBuilder));
  let handlers = HandlerTable::new().register("build", Box::new(BuildHandler::new(registry.clone())));

  let docker_pool = DockerHostPool::new();
  let endpoint = DockerEndpoint {
    url: cfg.docker_endpoint.clone(),
    ca_cert: cfg.docker_ca_cert.clone(),
    client_cert: cfg.docker_client_cert.clone(),
    client_key: cfg.docker_client_key.clone(),
  };
  let client = docker_pool.get_or_connect("local", &endpoint)?;
  let docker = Arc::new(DockerService::new(client));
  let fleet = Arc::new(Fleet::default());

  if cfg.local_mode {
    info!("starting in local mode: REST controller only");
    let queues = queue_set();
    let completion = connect_with_retry(queues.completion, 5).await?;
    let errors = connect_with_retry(queues.errors, 5).await?;
    let status = connect_with_retry(queues.status, 5).await?;
    let controller = Arc::new(CommandController::new(
      handlers,
      completion,
      errors,
      status,
      cfg.max_message_retries,
    ));
    let state = Arc::new(RestState { controller, docker, fleet });
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    axum::serve(listener, rest::router(state)).await?;
    return Ok(());
  }

  let queues = queue_set();
  genesis_queue::assert_disjoint_queues(&queues)?;

  let cmd_handle = connect_with_retry(queues.cmd, 5).await?;
  let completion = connect_with_retry(queues.completion, 5).await?;
  let errors = connect_with_retry(queues.errors, 5).await?;
  let status = connect_with_retry(queues.status, 5).await?;
  let controller = Arc::new(CommandController::new(
    handlers,
    completion,
    errors,
    status,
    cfg.max_message_retries,
  ));

  let mut consumer = cmd_handle.consumer("genesis-engine").await?;
  info!("command controller listening");
  while let Some(parsed) = next_command(&mut consumer).await {
    let controller = controller.clone();
    let docker = docker.clone();
    let fleet = fleet.clone();
    tokio::spawn(async move {
      match parsed {
        Ok(command) => {
          let build_state = BuildState::new();
          if let Err(e) = controller.dispatch(command, docker, fleet, &build_state).await {
            error!("command failed terminally: {}", e.message);
          }
        }
        Err(e) => {
          error!("discarding poisoned command: {}", e.message);
          controller.publish_poisoned(&e).await;
        }
      }
    });
  }
  drop(cmd_handle);
  Ok(())
}
