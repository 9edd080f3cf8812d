// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # rabbids
//!
//! A RabbitMQ client library with declarative topology, supervised
//! consumers and an asynchronous producer with broker-native delayed
//! delivery.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use futures_util::FutureExt;
//! use rabbids::{start_supervisor, Config, MessageHandlerFunc, Rabbids};
//!
//! # async fn example() -> Result<(), rabbids::RabbidsError> {
//! let mut config = Config::from_filename("rabbids.yaml")?;
//! config.register_handler(
//!     "messaging_consumer",
//!     MessageHandlerFunc::new(|message| {
//!         async move {
//!             let _ = message.ack(false).await;
//!         }
//!         .boxed()
//!     }),
//! );
//!
//! let client = Rabbids::new(config).await?;
//! let supervisor = start_supervisor(client, Duration::from_secs(1)).await?;
//! // ...
//! supervisor.stop().await;
//! # Ok(())
//! # }
//! ```

mod connection;
mod otel;

pub mod client;
pub mod config;
pub mod consumer;
pub mod delay;
pub mod errors;
pub mod handler;
pub mod message;
pub mod producer;
pub mod serialization;
pub mod supervisor;
pub mod topology;

pub use client::Rabbids;
pub use config::{Config, Connection, ConsumerConfig, ExchangeConfig, Options, QueueConfig};
pub use consumer::Consumer;
pub use delay::{calculate_routing_key, DELAY_DELIVERY_EXCHANGE, MAX_DELAY};
pub use errors::{ConfigError, RabbidsError};
pub use handler::{MessageHandler, MessageHandlerFunc};
pub use message::{
    with_correlation_id, with_delay, with_expiration, with_headers, with_message_id,
    with_priority, with_reply_to, Message, Publishing, PublishingError, PublishingOption,
};
pub use producer::{Producer, ProducerBuilder};
pub use serialization::{Json, Serializer};
pub use supervisor::{start_supervisor, Supervisor};

/// Crate version, advertised in the AMQP client properties of every
/// connection this library opens.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
