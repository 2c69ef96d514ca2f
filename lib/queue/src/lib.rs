//! Queue transport (spec.md §4.7, §6): four logical AMQP queues — `cmd`,
//! `completion`, `errors`, `status` — each independently configured and
//! checked for pairwise distinctness before the Command Controller ever
//! opens a consumer.
//!
//! Grounded on `original_source/main.go`'s queue wiring: one AMQP
//! connection per logical queue (`queue.OpenAMQPConnection` called four
//! times, not shared), asserted disjoint up front
//! (`queue.AssertUniqueQueues`) before any `queue.NewAMQPService` is
//! constructed. The examples pack carries no AMQP crate, so `lapin` is
//! an enrichment pick (see repo root `DESIGN.md`) standing in for the
//! original's `github.com/whiteblock/amqp` wrapper.

use std::time::Duration;

use futures_util::StreamExt;
use genesis_build_state::{
  Command, CompletionEnvelope, ErrorEnvelope, GenesisError, GenesisErrorKind, StatusEnvelope,
  parse_command,
};
use lapin::options::{
  BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
  QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, Consumer};
use serde::Serialize;
use tracing::{instrument, warn};

/// `{endpoint, exchange, routing_key, queue}` identity of one AMQP queue
/// (spec.md §6). Two `QueueConfig`s "overlap" when `endpoint` and
/// `queue` match — that pair alone names the same physical queue on
/// the broker, regardless of exchange/routing_key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueConfig {
  pub endpoint: String,
  pub exchange: String,
  pub routing_key: String,
  pub queue: String,
}

/// The four logical queues the Command Controller depends on.
pub struct QueueSet {
  pub cmd: QueueConfig,
  pub completion: QueueConfig,
  pub errors: QueueConfig,
  pub status: QueueConfig,
}

impl QueueSet {
  fn all(&self) -> [&QueueConfig; 4] {
    [&self.cmd, &self.completion, &self.errors, &self.status]
  }
}

/// P5: startup aborts iff any two of the four queues share
/// `(endpoint, queue)` — that pair alone identifies a physical AMQP
/// queue; a shared exchange/routing_key with distinct `(endpoint,
/// queue)` still delivers to two separate queues and is not an
/// overlap. Pairwise, not just adjacent — a queue that only collides
/// with the fourth entry must still be caught.
pub fn assert_disjoint_queues(queues: &QueueSet) -> Result<(), GenesisError> {
  let all = queues.all();
  for i in 0..all.len() {
    for j in (i + 1)..all.len() {
      if all[i].endpoint == all[j].endpoint && all[i].queue == all[j].queue {
        return Err(GenesisError::new(
          GenesisErrorKind::Config,
          format!(
            "queues overlap: {:?} and {:?} share the same endpoint/queue",
            all[i], all[j]
          ),
        ));
      }
    }
  }
  Ok(())
}

/// One open AMQP connection and channel scoped to a single logical
/// queue, matching the original's one-connection-per-queue wiring.
pub struct QueueHandle {
  config: QueueConfig,
  channel: lapin::Channel,
  /// Kept alive for as long as the channel is in use; dropping it closes
  /// the channel.
  _connection: Connection,
}

impl QueueHandle {
  #[instrument(skip(config), fields(queue = %config.queue))]
  pub async fn connect(config: QueueConfig) -> Result<Self, GenesisError> {
    let connection = Connection::connect(&config.endpoint, ConnectionProperties::default())
      .await
      .map_err(lapin_err)?;
    let channel = connection.create_channel().await.map_err(lapin_err)?;
    channel
      .exchange_declare(
        &config.exchange,
        lapin::ExchangeKind::Direct,
        ExchangeDeclareOptions { durable: true, ..Default::default() },
        FieldTable::default(),
      )
      .await
      .map_err(lapin_err)?;
    channel
      .queue_declare(
        &config.queue,
        QueueDeclareOptions { durable: true, ..Default::default() },
        FieldTable::default(),
      )
      .await
      .map_err(lapin_err)?;
    channel
      .queue_bind(
        &config.queue,
        &config.exchange,
        &config.routing_key,
        QueueBindOptions::default(),
        FieldTable::default(),
      )
      .await
      .map_err(lapin_err)?;
    Ok(QueueHandle { config, channel, _connection: connection })
  }

  async fn publish_json<T: Serialize>(&self, value: &T) -> Result<(), GenesisError> {
    let body = serde_json::to_vec(value).map_err(|e| {
      GenesisError::with_source(GenesisErrorKind::Permanent, "failed to encode envelope", e.into())
    })?;
    self
      .channel
      .basic_publish(
        &self.config.exchange,
        &self.config.routing_key,
        BasicPublishOptions::default(),
        &body,
        BasicProperties::default(),
      )
      .await
      .map_err(lapin_err)?
      .await
      .map_err(lapin_err)?;
    Ok(())
  }

  pub async fn publish_completion(&self, envelope: &CompletionEnvelope) -> Result<(), GenesisError> {
    self.publish_json(envelope).await
  }

  pub async fn publish_error(&self, envelope: &ErrorEnvelope) -> Result<(), GenesisError> {
    self.publish_json(envelope).await
  }

  pub async fn publish_status(&self, envelope: &StatusEnvelope) -> Result<(), GenesisError> {
    self.publish_json(envelope).await
  }

  pub async fn consumer(&self, consumer_tag: &str) -> Result<Consumer, GenesisError> {
    self
      .channel
      .basic_consume(
        &self.config.queue,
        consumer_tag,
        BasicConsumeOptions::default(),
        FieldTable::default(),
      )
      .await
      .map_err(lapin_err)
  }
}

/// Pulls the next inbound command off `consumer`, acking on successful
/// parse and nacking-by-ack-anyway on malformed payloads since a poison
/// message must never be redelivered into an infinite loop (spec.md
/// §4.7 `POISONED` transition: ack, emit to the error queue, move on).
pub async fn next_command(consumer: &mut Consumer) -> Option<Result<Command, GenesisError>> {
  let delivery = consumer.next().await?.ok()?;
  let result = parse_command(&delivery.data);
  if delivery.ack(BasicAckOptions::default()).await.is_err() {
    warn!("failed to ack AMQP delivery");
  }
  Some(result)
}

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Retries `QueueHandle::connect` with a fixed backoff; the Command
/// Controller calls this at boot so a broker that isn't up yet doesn't
/// take the whole process down immediately.
pub async fn connect_with_retry(
  config: QueueConfig,
  attempts: usize,
) -> Result<QueueHandle, GenesisError> {
  let mut last_err = None;
  for attempt in 0..attempts {
    match QueueHandle::connect(config.clone()).await {
      Ok(handle) => return Ok(handle),
      Err(e) => {
        warn!(attempt, "failed to connect to AMQP broker: {}", e.message);
        last_err = Some(e);
        tokio::time::sleep(RECONNECT_BACKOFF).await;
      }
    }
  }
  Err(last_err.unwrap_or_else(|| GenesisError::transient("exhausted AMQP connect attempts")))
}

fn lapin_err(e: lapin::Error) -> GenesisError {
  GenesisError::with_source(GenesisErrorKind::Transient, "amqp operation failed", e.into())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn queue(endpoint: &str, exchange: &str, routing_key: &str, queue: &str) -> QueueConfig {
    QueueConfig {
      endpoint: endpoint.into(),
      exchange: exchange.into(),
      routing_key: routing_key.into(),
      queue: queue.into(),
    }
  }

  #[test]
  fn disjoint_queues_pass() {
    let queues = QueueSet {
      cmd: queue("amqp://localhost", "genesis", "cmd.rk", "cmd"),
      completion: queue("amqp://localhost", "genesis", "completion.rk", "completion"),
      errors: queue("amqp://localhost", "genesis", "errors.rk", "errors"),
      status: queue("amqp://localhost", "genesis", "status.rk", "status"),
    };
    assert!(assert_disjoint_queues(&queues).is_ok());
  }

  /// P5 / spec.md §8 scenario 6: `cmd` and `errors` share `(endpoint,
  /// queue)` but have distinct routing keys, and must still be rejected
  /// — they are not adjacent in the struct either (cmd vs. errors).
  #[test]
  fn overlapping_queues_rejected() {
    let queues = QueueSet {
      cmd: queue("amqp://localhost", "genesis", "cmd.rk", "shared"),
      completion: queue("amqp://localhost", "genesis", "completion.rk", "completion"),
      errors: queue("amqp://localhost", "genesis", "errors.rk", "shared"),
      status: queue("amqp://localhost", "genesis", "status.rk", "status"),
    };
    assert!(assert_disjoint_queues(&queues).is_err());
  }
}
