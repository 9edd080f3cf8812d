// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # Message Surface
//!
//! [`Message`] wraps a broker delivery on the consuming side and exposes the
//! acknowledgement surface. [`Publishing`] is the value handed to the
//! producer, built with mutator options in the `with_*` family.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use serde_json::Value;

use crate::errors::RabbidsError;

/// One delivery received from the broker.
///
/// The consumer owns the delivery until it hands it to a worker; from there
/// ownership belongs to the handler, which MUST settle it with [`ack`],
/// [`nack`] or [`reject`] unless the consumer was configured with
/// `auto_ack`.
///
/// [`ack`]: Message::ack
/// [`nack`]: Message::nack
/// [`reject`]: Message::reject
pub struct Message {
    pub delivery: Delivery,
}

impl Message {
    pub(crate) fn new(delivery: Delivery) -> Message {
        Message { delivery }
    }

    pub fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    pub fn exchange(&self) -> &str {
        self.delivery.exchange.as_str()
    }

    pub fn routing_key(&self) -> &str {
        self.delivery.routing_key.as_str()
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.delivery.properties
    }

    /// Acknowledges the delivery; with `multiple` every delivery up to this
    /// tag is settled at once.
    pub async fn ack(&self, multiple: bool) -> Result<(), lapin::Error> {
        self.delivery.ack(BasicAckOptions { multiple }).await
    }

    /// Negatively acknowledges the delivery, optionally requeueing it.
    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), lapin::Error> {
        self.delivery
            .nack(BasicNackOptions { multiple, requeue })
            .await
    }

    /// Rejects the delivery, optionally requeueing it.
    pub async fn reject(&self, requeue: bool) -> Result<(), lapin::Error> {
        self.delivery.reject(BasicRejectOptions { requeue }).await
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("exchange", &self.exchange())
            .field("routing_key", &self.routing_key())
            .field("delivery_tag", &self.delivery_tag())
            .finish_non_exhaustive()
    }
}

/// A function that mutates a [`Publishing`] before it is sent.
pub type PublishingOption = Box<dyn FnOnce(&mut Publishing) + Send>;

/// A message on its way to the broker.
///
/// `data` is serialized by the producer's configured
/// [`Serializer`](crate::serialization::Serializer) at send time; the
/// resulting content type is stamped on the properties. Options are applied
/// by the producer, in the order they were attached, before anything else.
pub struct Publishing {
    pub exchange: String,
    pub key: String,
    /// Delivery delay; `Duration::ZERO` publishes immediately.
    pub delay: Duration,
    pub data: Value,
    pub properties: BasicProperties,
    pub(crate) options: Vec<PublishingOption>,
}

impl Publishing {
    pub fn new(exchange: impl Into<String>, key: impl Into<String>, data: Value) -> Publishing {
        Publishing {
            exchange: exchange.into(),
            key: key.into(),
            delay: Duration::ZERO,
            data,
            properties: BasicProperties::default(),
            options: Vec::new(),
        }
    }

    /// Attaches an option to be applied at send time.
    pub fn with(mut self, option: PublishingOption) -> Publishing {
        self.options.push(option);
        self
    }

    pub(crate) fn apply_options(&mut self) {
        for option in std::mem::take(&mut self.options) {
            option(self);
        }
    }
}

impl fmt::Debug for Publishing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publishing")
            .field("exchange", &self.exchange)
            .field("key", &self.key)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

/// Sets the message priority, clamped to the 0..=9 range the broker
/// honours.
pub fn with_priority(priority: u8) -> PublishingOption {
    Box::new(move |publishing| {
        let properties = std::mem::take(&mut publishing.properties);
        publishing.properties = properties.with_priority(priority.min(9));
    })
}

/// Sets the per-message expiration, in milliseconds.
pub fn with_expiration(milliseconds: u64) -> PublishingOption {
    Box::new(move |publishing| {
        let properties = std::mem::take(&mut publishing.properties);
        publishing.properties =
            properties.with_expiration(ShortString::from(milliseconds.to_string()));
    })
}

/// Merges the given headers into the message's header table. Existing keys
/// are overwritten.
pub fn with_headers(headers: BTreeMap<ShortString, AMQPValue>) -> PublishingOption {
    Box::new(move |publishing| {
        let properties = std::mem::take(&mut publishing.properties);
        let mut table = properties.headers().clone().unwrap_or_default().inner().clone();
        table.extend(headers);
        publishing.properties = properties.with_headers(FieldTable::from(table));
    })
}

pub fn with_reply_to(reply_to: impl Into<String>) -> PublishingOption {
    let reply_to = reply_to.into();
    Box::new(move |publishing| {
        let properties = std::mem::take(&mut publishing.properties);
        publishing.properties = properties.with_reply_to(ShortString::from(reply_to));
    })
}

pub fn with_correlation_id(id: impl Into<String>) -> PublishingOption {
    let id = id.into();
    Box::new(move |publishing| {
        let properties = std::mem::take(&mut publishing.properties);
        publishing.properties = properties.with_correlation_id(ShortString::from(id));
    })
}

pub fn with_message_id(id: impl Into<String>) -> PublishingOption {
    let id = id.into();
    Box::new(move |publishing| {
        let properties = std::mem::take(&mut publishing.properties);
        publishing.properties = properties.with_message_id(ShortString::from(id));
    })
}

/// Delays the delivery through the delay-delivery cascade. Granularity is
/// one second; values above [`MAX_DELAY`](crate::delay::MAX_DELAY) are
/// clamped at send time.
pub fn with_delay(delay: Duration) -> PublishingOption {
    Box::new(move |publishing| {
        publishing.delay = delay;
    })
}

/// An error produced while processing one [`Publishing`] on the
/// asynchronous emit path. Carries the message back so callers can inspect
/// or re-emit it.
#[derive(Debug)]
pub struct PublishingError {
    pub publishing: Publishing,
    pub error: RabbidsError,
}

impl fmt::Display for PublishingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to publish to \"{}\" with key \"{}\": {}",
            self.publishing.exchange, self.publishing.key, self.error
        )
    }
}

impl std::error::Error for PublishingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_is_clamped_to_the_broker_range() {
        let mut publishing =
            Publishing::new("event_bus", "service.sms.send", json!({})).with(with_priority(42));
        publishing.apply_options();

        assert_eq!(publishing.properties.priority(), &Some(9));
    }

    #[test]
    fn expiration_is_rendered_in_milliseconds() {
        let mut publishing =
            Publishing::new("event_bus", "k", json!({})).with(with_expiration(1500));
        publishing.apply_options();

        assert_eq!(
            publishing.properties.expiration(),
            &Some(ShortString::from("1500"))
        );
    }

    #[test]
    fn headers_merge_instead_of_replacing() {
        let mut first = BTreeMap::new();
        first.insert(ShortString::from("tenant"), AMQPValue::LongString("a".into()));
        first.insert(ShortString::from("attempt"), AMQPValue::LongLongInt(1));

        let mut second = BTreeMap::new();
        second.insert(ShortString::from("attempt"), AMQPValue::LongLongInt(2));

        let mut publishing = Publishing::new("ex", "k", json!({}))
            .with(with_headers(first))
            .with(with_headers(second));
        publishing.apply_options();

        let headers = publishing.properties.headers().clone().unwrap_or_default();
        let inner = headers.inner();
        assert_eq!(
            inner.get(&ShortString::from("tenant")),
            Some(&AMQPValue::LongString("a".into()))
        );
        assert_eq!(
            inner.get(&ShortString::from("attempt")),
            Some(&AMQPValue::LongLongInt(2))
        );
    }

    #[test]
    fn delay_and_identity_options_apply() {
        let mut publishing = Publishing::new("ex", "k", json!({"fooo": "bazzz"}))
            .with(with_delay(Duration::from_secs(5)))
            .with(with_correlation_id("corr-1"))
            .with(with_reply_to("responses"))
            .with(with_message_id("msg-1"));
        publishing.apply_options();

        assert_eq!(publishing.delay, Duration::from_secs(5));
        assert_eq!(
            publishing.properties.correlation_id(),
            &Some(ShortString::from("corr-1"))
        );
        assert_eq!(
            publishing.properties.reply_to(),
            &Some(ShortString::from("responses"))
        );
        assert_eq!(
            publishing.properties.message_id(),
            &Some(ShortString::from("msg-1"))
        );
    }
}
