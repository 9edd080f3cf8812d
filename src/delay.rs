// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # Delayed Delivery
//!
//! Delayed delivery is built entirely from broker-native features: topic
//! exchanges, per-queue TTLs and dead-lettering. The topology is a binary
//! cascade of 28 levels, where level `k` holds messages for `2^k` seconds
//! before dead-lettering them one level down. A message's routing key spells
//! out, bit by bit, which levels it must wait in, so any delay up to
//! `2^28 - 1` seconds (roughly eight and a half years) can be expressed.
//!
//! The setup mirrors the delayed-delivery infrastructure documented by the
//! NServiceBus project for its RabbitMQ transport:
//! <https://docs.particular.net/transports/rabbitmq/delayed-delivery>.

use std::time::Duration;

use lapin::options::{
    ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::errors::RabbidsError;
use crate::topology::{
    AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_MESSAGE_TTL, AMQP_HEADERS_QUEUE_MODE,
};

const MAX_BITS: usize = 28;
const MAX_LEVEL: usize = MAX_BITS - 1;

/// The longest expressible delay: `2^28 - 1` seconds. Longer delays are
/// clamped.
pub const MAX_DELAY: Duration = Duration::from_secs((1 << MAX_BITS) - 1);

/// The terminal exchange. Messages that consumed all their delay bits land
/// here and are routed into their destination queue by a `#.<queue>`
/// binding.
pub const DELAY_DELIVERY_EXCHANGE: &str = "rabbids.delay-delivery";

/// Owns the one-shot declaration of the cascade.
///
/// The topology is declared at most once per producer instance; concurrent
/// sends race on the latch and exactly one of them builds it.
#[derive(Default)]
pub(crate) struct DelayDelivery {
    declared: OnceCell<()>,
}

impl DelayDelivery {
    /// Declares the cascade (first call only) and binds `queue` to the
    /// terminal exchange so delayed messages addressed to it can exit.
    pub(crate) async fn declare(&self, channel: &Channel, queue: &str) -> Result<(), RabbidsError> {
        self.declared
            .get_or_try_init(|| self.build(channel))
            .await?;

        channel
            .queue_bind(
                queue,
                DELAY_DELIVERY_EXCHANGE,
                &format!("#.{queue}"),
                QueueBindOptions { nowait: true },
                FieldTable::default(),
            )
            .await
            .map_err(|source| RabbidsError::Topology {
                entity: format!("delay-delivery binding for queue \"{queue}\""),
                source,
            })?;

        Ok(())
    }

    /// Creates all the levels of exchanges and queues.
    ///
    /// Each level gets three pieces: a topic exchange, a TTL queue bound to
    /// it with the "bit set" pattern (the message waits here), and an
    /// exchange-to-exchange binding from the level below with the "bit
    /// clear" pattern (the message skips the wait). The terminal exchange
    /// collects whatever falls out of level 0.
    async fn build(&self, channel: &Channel) -> Result<(), RabbidsError> {
        debug!("declaring the delay-delivery topology");

        for level in (0..=MAX_LEVEL).rev() {
            let current = level_name(level);
            let next = if level == 0 {
                DELAY_DELIVERY_EXCHANGE.to_owned()
            } else {
                level_name(level - 1)
            };

            channel
                .exchange_declare(
                    &current,
                    ExchangeKind::Topic,
                    durable_exchange(),
                    FieldTable::default(),
                )
                .await
                .map_err(|source| RabbidsError::Topology {
                    entity: format!("delay exchange \"{current}\""),
                    source,
                })?;

            let mut args = FieldTable::default();
            args.insert(
                AMQP_HEADERS_QUEUE_MODE.into(),
                AMQPValue::LongString("lazy".into()),
            );
            args.insert(
                AMQP_HEADERS_MESSAGE_TTL.into(),
                AMQPValue::LongLongInt((1_i64 << level) * 1000),
            );
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.into(),
                AMQPValue::LongString(next.as_str().into()),
            );

            channel
                .queue_declare(
                    &current,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    args,
                )
                .await
                .map_err(|source| RabbidsError::Topology {
                    entity: format!("delay queue \"{current}\""),
                    source,
                })?;

            channel
                .queue_bind(
                    &current,
                    &current,
                    &wait_pattern(level),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|source| RabbidsError::Topology {
                    entity: format!("delay binding for level {level}"),
                    source,
                })?;
        }

        for level in (1..=MAX_LEVEL).rev() {
            channel
                .exchange_bind(
                    &level_name(level - 1),
                    &level_name(level),
                    &skip_pattern(level),
                    ExchangeBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|source| RabbidsError::Topology {
                    entity: format!("delay exchange binding from level {level}"),
                    source,
                })?;
        }

        channel
            .exchange_declare(
                DELAY_DELIVERY_EXCHANGE,
                ExchangeKind::Topic,
                durable_exchange(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| RabbidsError::Topology {
                entity: format!("delay exchange \"{DELAY_DELIVERY_EXCHANGE}\""),
                source,
            })?;

        channel
            .exchange_bind(
                DELAY_DELIVERY_EXCHANGE,
                &level_name(0),
                &skip_pattern(0),
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| RabbidsError::Topology {
                entity: "delay-delivery terminal binding".to_owned(),
                source,
            })?;

        Ok(())
    }
}

/// Returns the routing key and the first applicable exchange for a delayed
/// message, so the producer can skip the levels above the highest set bit.
///
/// The key is 28 dotted bit segments, highest level first, followed by the
/// destination address: `b27.b26.(...).b0.address`. Delays above
/// [`MAX_DELAY`] are clamped; granularity is one second.
pub fn calculate_routing_key(delay: Duration, address: &str) -> (String, String) {
    let delay = delay.min(MAX_DELAY);
    let sec = delay.as_secs() as u32;

    let mut key = String::with_capacity(2 * MAX_BITS + address.len());
    let mut first_level = 0;

    for level in (0..=MAX_LEVEL).rev() {
        if sec & (1 << level) != 0 {
            if first_level == 0 {
                first_level = level;
            }
            key.push_str("1.");
        } else {
            key.push_str("0.");
        }
    }

    key.push_str(address);

    (key, level_name(first_level))
}

pub(crate) fn level_name(level: usize) -> String {
    format!("rabbids.delay-level-{level}")
}

/// Binding pattern matching routing keys whose bit at `level` is set.
fn wait_pattern(level: usize) -> String {
    bit_pattern(level, '1')
}

/// Binding pattern matching routing keys whose bit at `level` is clear.
fn skip_pattern(level: usize) -> String {
    bit_pattern(level, '0')
}

fn bit_pattern(level: usize, bit: char) -> String {
    let mut pattern = "*.".repeat(MAX_LEVEL - level);
    pattern.push(bit);
    pattern.push_str(".#");
    pattern
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_delay_produces_all_clear_bits_and_level_zero() {
        let (key, exchange) = calculate_routing_key(Duration::ZERO, "q");

        assert_eq!(
            key,
            "0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.q"
        );
        assert_eq!(exchange, "rabbids.delay-level-0");
    }

    #[test]
    fn one_second_sets_only_the_lowest_bit() {
        let (key, exchange) = calculate_routing_key(Duration::from_secs(1), "q");

        assert_eq!(
            key,
            "0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.1.q"
        );
        assert_eq!(exchange, "rabbids.delay-level-0");
    }

    #[test]
    fn five_seconds_sets_bits_zero_and_two() {
        let (key, exchange) = calculate_routing_key(Duration::from_secs(5), "q");

        let segments: Vec<&str> = key.split('.').collect();
        assert_eq!(segments.len(), 29);
        assert_eq!(segments[28], "q");
        for (position, segment) in segments[..28].iter().enumerate() {
            let expected = if position == 25 || position == 27 { "1" } else { "0" };
            assert_eq!(*segment, expected, "segment {position}");
        }

        assert_eq!(exchange, "rabbids.delay-level-2");
    }

    #[test]
    fn first_exchange_is_the_highest_set_bit() {
        let (key, exchange) = calculate_routing_key(Duration::from_secs(1 << 27), "inbox");

        assert!(key.starts_with("1."));
        assert_eq!(exchange, "rabbids.delay-level-27");
    }

    #[test]
    fn delays_above_the_maximum_are_clamped() {
        let (clamped, exchange) = calculate_routing_key(MAX_DELAY + Duration::from_secs(100), "q");
        let (max, _) = calculate_routing_key(MAX_DELAY, "q");

        assert_eq!(clamped, max);
        assert_eq!(exchange, "rabbids.delay-level-27");
        assert!(!clamped[..2 * MAX_BITS].contains('0'));
    }

    #[test]
    fn routing_key_bits_sum_back_to_the_delay() {
        for seconds in [0_u64, 1, 5, 42, 3600, 86_401, 10_000_000] {
            let (key, _) = calculate_routing_key(Duration::from_secs(seconds), "q");

            let total: u64 = key
                .split('.')
                .take(MAX_BITS)
                .enumerate()
                .filter(|(_, bit)| *bit == "1")
                .map(|(position, _)| 1 << (MAX_LEVEL - position))
                .sum();

            assert_eq!(total, seconds);
        }
    }

    #[test]
    fn wait_patterns_anchor_the_set_bit_at_its_level() {
        assert_eq!(wait_pattern(MAX_LEVEL), "1.#");
        assert_eq!(wait_pattern(26), "*.1.#");
        assert_eq!(wait_pattern(0), format!("{}1.#", "*.".repeat(27)));
    }

    #[test]
    fn skip_patterns_match_the_cleared_bit() {
        assert_eq!(skip_pattern(MAX_LEVEL), "0.#");
        assert_eq!(skip_pattern(0), format!("{}0.#", "*.".repeat(27)));
    }
}
