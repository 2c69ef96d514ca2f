//! Process configuration (spec.md §6): CLI args layered over
//! environment variables layered over defaults, exposed through a
//! process-wide `OnceLock`.
//!
//! Grounded on Komodo's `periphery_config()` / `core_config()` pattern
//! (`bin/periphery/src/config.rs`): a `clap::Parser` struct merged with
//! an `envy`-deserialized environment struct, collapsed into one config
//! type behind a `OnceLock` accessor so the rest of the binary reads it
//! without threading it through every call.

use std::path::PathBuf;
use std::sync::OnceLock;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug, Default)]
#[command(name = "genesis-engine")]
pub struct CliArgs {
  #[arg(long)]
  pub local_mode: Option<bool>,
  #[arg(long)]
  pub debug_mode: Option<bool>,
  #[arg(long)]
  pub max_message_retries: Option<u32>,
  #[arg(long)]
  pub node_prefix: Option<String>,
}

/// Mirrors `CliArgs` field-for-field so `envy` can populate it from
/// `GENESIS_*` environment variables; merged with CLI args afterward
/// (CLI wins on a field-by-field basis).
#[derive(Deserialize, Debug, Default)]
struct EnvArgs {
  local_mode: Option<bool>,
  debug_mode: Option<bool>,
  max_message_retries: Option<u32>,
  node_prefix: Option<String>,
  docker_endpoint: Option<String>,
  docker_ca_cert: Option<PathBuf>,
  docker_client_cert: Option<PathBuf>,
  docker_client_key: Option<PathBuf>,
  execution_worker_limit: Option<usize>,
  amqp_endpoint: Option<String>,
  amqp_exchange: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
  pub worker_limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct GenesisConfig {
  /// If true, only the REST path (C10) is started; the AMQP Command
  /// Controller (C7) is skipped entirely.
  pub local_mode: bool,
  pub debug_mode: bool,
  pub max_message_retries: u32,
  pub node_prefix: String,
  pub docker_endpoint: String,
  pub docker_ca_cert: Option<PathBuf>,
  pub docker_client_cert: Option<PathBuf>,
  pub docker_client_key: Option<PathBuf>,
  pub execution: ExecutionConfig,
  pub amqp_endpoint: String,
  pub amqp_exchange: String,
}

impl Default for GenesisConfig {
  fn default() -> Self {
    GenesisConfig {
      local_mode: false,
      debug_mode: false,
      max_message_retries: 3,
      node_prefix: "genesis-".to_string(),
      docker_endpoint: "unix:///var/run/docker.sock".to_string(),
      docker_ca_cert: None,
      docker_client_cert: None,
      docker_client_key: None,
      execution: ExecutionConfig { worker_limit: None },
      amqp_endpoint: "amqp://127.0.0.1:5672/%2f".to_string(),
      amqp_exchange: "genesis".to_string(),
    }
  }
}

impl GenesisConfig {
  fn merge(cli: CliArgs, env: EnvArgs) -> Self {
    let defaults = GenesisConfig::default();
    GenesisConfig {
      local_mode: cli.local_mode.or(env.local_mode).unwrap_or(defaults.local_mode),
      debug_mode: cli.debug_mode.or(env.debug_mode).unwrap_or(defaults.debug_mode),
      max_message_retries: cli
        .max_message_retries
        .or(env.max_message_retries)
        .unwrap_or(defaults.max_message_retries),
      node_prefix: cli.node_prefix.or(env.node_prefix).unwrap_or(defaults.node_prefix),
      docker_endpoint: env.docker_endpoint.unwrap_or(defaults.docker_endpoint),
      docker_ca_cert: env.docker_ca_cert,
      docker_client_cert: env.docker_client_cert,
      docker_client_key: env.docker_client_key,
      execution: ExecutionConfig {
        worker_limit: env.execution_worker_limit,
      },
      amqp_endpoint: env.amqp_endpoint.unwrap_or(defaults.amqp_endpoint),
      amqp_exchange: env.amqp_exchange.unwrap_or(defaults.amqp_exchange),
    }
  }

  pub fn load() -> anyhow::Result<Self> {
    dotenvy::dotenv().ok();
    let cli = CliArgs::parse();
    let env: EnvArgs = envy::prefixed("GENESIS_").from_env()?;
    Ok(GenesisConfig::merge(cli, env))
  }
}

pub fn config() -> &'static GenesisConfig {
  static CONFIG: OnceLock<GenesisConfig> = OnceLock::new();
  CONFIG.get_or_init(|| GenesisConfig::load().expect("invalid Genesis configuration"))
}
