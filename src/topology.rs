// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # Topology Declarations
//!
//! This module turns the declarative [`Config`] into broker state. The
//! declarations phase runs before any consumer starts and is strictly
//! ordered: exchanges first, then dead-letter queues, then consumer queues,
//! then bindings. Declarations are idempotent on the broker side; declaring
//! the same entity twice with identical parameters is a no-op, while
//! conflicting parameters fail hard with a
//! [`RabbidsError::Topology`](crate::errors::RabbidsError) error.
//!
//! The producer uses the lazy variant, [`Declarations::declare_exchange`],
//! which only declares exchanges present in the configuration and silently
//! skips unknown names (the broker rejects the subsequent publish, and that
//! error travels through the producer's retry/emit-err path).

use std::collections::HashMap;
use std::sync::Arc;

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use tracing::{debug, warn};

use crate::config::{Config, ConsumerConfig, ExchangeConfig, Options, QueueConfig};
use crate::errors::RabbidsError;

/// Header field used to route expired or rejected messages to an exchange.
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field used to override the routing key of dead-lettered messages.
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header field used to specify the per-queue message TTL.
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field selecting the queue mode (`lazy` keeps messages on disk).
pub const AMQP_HEADERS_QUEUE_MODE: &str = "x-queue-mode";

/// Declares exchanges, queues and bindings from a [`Config`].
#[derive(Clone, Debug)]
pub(crate) struct Declarations {
    config: Arc<Config>,
}

impl Declarations {
    pub(crate) fn new(config: Arc<Config>) -> Declarations {
        Declarations { config }
    }

    /// Installs the whole configured topology on the given channel.
    ///
    /// Ordering matters: every exchange must exist before a queue binds to
    /// it, and dead-letter queues must exist before the queues that
    /// reference them start routing rejections.
    pub(crate) async fn declare_all(&self, channel: &Channel) -> Result<(), RabbidsError> {
        for (name, exchange) in &self.config.exchanges {
            self.install_exchange(channel, name, exchange).await?;
        }

        for dead_letter in self.config.dead_letters.values() {
            self.install_queue(channel, &dead_letter.queue, None).await?;
        }

        for consumer in self.config.consumers.values() {
            let dead_letter = self.dead_letter_queue_name(consumer);
            self.install_queue(channel, &consumer.queue, dead_letter)
                .await?;
        }

        Ok(())
    }

    /// Declares a single exchange by name, used by the producer on first
    /// publish. Returns `false` when the name is not part of the
    /// configuration, in which case nothing is declared.
    pub(crate) async fn declare_exchange(
        &self,
        channel: &Channel,
        name: &str,
    ) -> Result<bool, RabbidsError> {
        let Some(exchange) = self.config.exchanges.get(name) else {
            debug!(exchange = name, "exchange not configured, skipping declaration");
            return Ok(false);
        };

        self.install_exchange(channel, name, exchange).await?;

        Ok(true)
    }

    async fn install_exchange(
        &self,
        channel: &Channel,
        name: &str,
        exchange: &ExchangeConfig,
    ) -> Result<(), RabbidsError> {
        debug!(exchange = name, "declaring exchange");

        let opts = &exchange.options;
        channel
            .exchange_declare(
                name,
                exchange.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: opts.durable,
                    auto_delete: opts.auto_delete,
                    internal: opts.internal,
                    nowait: opts.no_wait,
                },
                field_table(&opts.args),
            )
            .await
            .map_err(|source| RabbidsError::Topology {
                entity: format!("exchange \"{name}\""),
                source,
            })
    }

    async fn install_queue(
        &self,
        channel: &Channel,
        queue: &QueueConfig,
        dead_letter: Option<&str>,
    ) -> Result<(), RabbidsError> {
        debug!(queue = %queue.name, "declaring queue");

        let mut args = field_table(&queue.options.args);
        if let Some(target) = dead_letter {
            // Rejections go through the default exchange straight into the
            // dead-letter queue.
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.into(),
                AMQPValue::LongString("".into()),
            );
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.into(),
                AMQPValue::LongString(target.into()),
            );
        }

        channel
            .queue_declare(&queue.name, queue_declare_options(&queue.options), args)
            .await
            .map_err(|source| RabbidsError::Topology {
                entity: format!("queue \"{}\"", queue.name),
                source,
            })?;

        for binding in &queue.bindings {
            for routing_key in &binding.routing_keys {
                debug!(
                    queue = %queue.name,
                    exchange = %binding.exchange,
                    routing_key = %routing_key,
                    "binding queue"
                );

                channel
                    .queue_bind(
                        &queue.name,
                        &binding.exchange,
                        routing_key,
                        QueueBindOptions {
                            nowait: binding.options.no_wait,
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|source| RabbidsError::Topology {
                        entity: format!(
                            "binding of queue \"{}\" to exchange \"{}\"",
                            queue.name, binding.exchange
                        ),
                        source,
                    })?;
            }
        }

        Ok(())
    }

    fn dead_letter_queue_name<'a>(&'a self, consumer: &ConsumerConfig) -> Option<&'a str> {
        let name = consumer.dead_letter.as_deref()?;

        match self.config.dead_letters.get(name) {
            Some(dead_letter) => Some(dead_letter.queue.name.as_str()),
            None => {
                warn!(
                    dead_letter = name,
                    queue = %consumer.queue.name,
                    "dead letter is not declared in the configuration, ignoring"
                );
                None
            }
        }
    }
}

pub(crate) fn queue_declare_options(options: &Options) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: options.durable,
        exclusive: options.exclusive,
        auto_delete: options.auto_delete,
        nowait: options.no_wait,
    }
}

/// Converts the free-form `args` map from the configuration into an AMQP
/// field table. Strings, booleans, integers and floats are supported; any
/// other YAML shape is skipped with a warning.
pub(crate) fn field_table(args: &HashMap<String, serde_yaml::Value>) -> FieldTable {
    let mut table = FieldTable::default();

    for (key, value) in args {
        match yaml_to_amqp(value) {
            Some(converted) => table.insert(key.as_str().into(), converted),
            None => warn!(key = %key, "unsupported queue/exchange argument type, skipping"),
        }
    }

    table
}

fn yaml_to_amqp(value: &serde_yaml::Value) -> Option<AMQPValue> {
    match value {
        serde_yaml::Value::Bool(b) => Some(AMQPValue::Boolean(*b)),
        serde_yaml::Value::Number(n) if n.is_i64() => n.as_i64().map(AMQPValue::LongLongInt),
        serde_yaml::Value::Number(n) => n.as_f64().map(AMQPValue::Double),
        serde_yaml::Value::String(s) => Some(AMQPValue::LongString(s.as_str().into())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn args_convert_to_a_field_table() {
        let mut args = HashMap::new();
        args.insert(
            "x-queue-mode".to_owned(),
            serde_yaml::Value::String("lazy".to_owned()),
        );
        args.insert(
            "x-max-length".to_owned(),
            serde_yaml::Value::Number(serde_yaml::Number::from(10_000)),
        );
        args.insert("x-single-active-consumer".to_owned(), serde_yaml::Value::Bool(true));
        args.insert("ignored".to_owned(), serde_yaml::Value::Null);

        let table = field_table(&args);
        let inner = table.inner();

        assert_eq!(
            inner.get(&ShortString::from("x-queue-mode")),
            Some(&AMQPValue::LongString("lazy".into()))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-max-length")),
            Some(&AMQPValue::LongLongInt(10_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-single-active-consumer")),
            Some(&AMQPValue::Boolean(true))
        );
        assert!(inner.get(&ShortString::from("ignored")).is_none());
    }

    #[test]
    fn queue_options_map_onto_lapin() {
        let options = Options {
            durable: true,
            exclusive: true,
            ..Options::default()
        };

        let declare = queue_declare_options(&options);
        assert!(declare.durable);
        assert!(declare.exclusive);
        assert!(!declare.auto_delete);
        assert!(!declare.nowait);
    }
}
