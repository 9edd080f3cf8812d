// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Factory
//!
//! This module opens and configures broker connections from a
//! [`Connection`](crate::config::Connection) config. Every connection
//! advertises the client name plus the crate's product/version pair in its
//! AMQP client properties, which makes rabbids connections identifiable in
//! the broker's management plane.

use lapin::types::{AMQPValue, LongString};
use lapin::ConnectionProperties;
use tracing::{debug, warn};

use crate::config::Connection;
use crate::errors::RabbidsError;
use crate::VERSION;

/// Opens an AMQP connection described by `conf`.
///
/// Each attempt is bounded by the configured dial timeout and the factory
/// retries `retries` extra times, sleeping `sleep` in between. `name` is the
/// configuration key used in error messages; `client_name` is advertised to
/// the broker as the connection name.
pub(crate) async fn open_connection(
    conf: &Connection,
    name: &str,
    client_name: &str,
) -> Result<lapin::Connection, RabbidsError> {
    let mut properties =
        ConnectionProperties::default().with_connection_name(LongString::from(client_name));
    properties
        .client_properties
        .insert("product".into(), AMQPValue::LongString("rabbids".into()));
    properties
        .client_properties
        .insert("version".into(), AMQPValue::LongString(VERSION.into()));

    let mut remaining = conf.retries + 1;

    loop {
        debug!(connection = name, dsn = %conf.dsn, "opening amqp connection");

        let attempt = tokio::time::timeout(
            conf.timeout,
            lapin::Connection::connect(&conf.dsn, properties.clone()),
        )
        .await;

        remaining -= 1;

        match attempt {
            Ok(Ok(connection)) => {
                debug!(connection = name, "amqp connection established");
                return Ok(connection);
            }
            Ok(Err(source)) => {
                if remaining == 0 {
                    return Err(RabbidsError::ConnectionOpen {
                        name: name.to_owned(),
                        source,
                    });
                }
                warn!(connection = name, error = %source, "connection attempt failed, retrying");
            }
            Err(_) => {
                if remaining == 0 {
                    return Err(RabbidsError::ConnectionTimeout {
                        name: name.to_owned(),
                        timeout: conf.timeout,
                    });
                }
                warn!(connection = name, timeout = ?conf.timeout, "connection attempt timed out, retrying");
            }
        }

        tokio::time::sleep(conf.sleep).await;
    }
}
