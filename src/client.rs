// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # Client
//!
//! [`Rabbids`] owns the configuration and one broker connection per named
//! connection config. It builds consumers on demand, reopening any
//! connection the broker dropped in the meantime. The supervisor drives it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use lapin::options::BasicQosOptions;
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::open_connection;
use crate::consumer::Consumer;
use crate::errors::RabbidsError;
use crate::topology::Declarations;

/// The consumer-side client: connections, declarations and consumer
/// construction.
#[derive(Debug)]
pub struct Rabbids {
    config: Arc<Config>,
    declarations: Declarations,
    connections: HashMap<String, lapin::Connection>,
    sequence: AtomicI64,
}

impl Rabbids {
    /// Opens every configured connection. Fails with the connection's name
    /// in the error when the broker cannot be reached within the configured
    /// retries.
    pub async fn new(mut config: Config) -> Result<Rabbids, RabbidsError> {
        config.normalize();
        let config = Arc::new(config);

        let mut connections = HashMap::new();
        for (name, conf) in &config.connections {
            let connection = open_connection(conf, name, &format!("rabbids.{name}")).await?;
            connections.insert(name.clone(), connection);
        }

        Ok(Rabbids {
            declarations: Declarations::new(config.clone()),
            config,
            connections,
            sequence: AtomicI64::new(1),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the declarations phase on a scratch channel of every
    /// connection. Failure here is fatal; the supervisor does not start.
    pub(crate) async fn declare_topology(&mut self) -> Result<(), RabbidsError> {
        let names: Vec<String> = self.connections.keys().cloned().collect();

        for name in names {
            let channel = self.create_channel(&name).await?;
            self.declarations.declare_all(&channel).await?;

            if let Err(err) = channel.close(200, "").await {
                warn!(connection = %name, error = %err, "error closing the declarations channel");
            }
        }

        Ok(())
    }

    /// Builds one consumer per configured entry with a registered handler.
    /// Entries without a handler are skipped with a warning.
    pub(crate) async fn create_consumers(&mut self) -> Result<Vec<Consumer>, RabbidsError> {
        let mut names: Vec<String> = self.config.consumers.keys().cloned().collect();
        names.sort();

        let mut consumers = Vec::with_capacity(names.len());
        for name in names {
            if !self.config.handlers.contains_key(&name) {
                warn!(consumer = %name, "no handler registered, skipping consumer");
                continue;
            }

            consumers.push(self.create_consumer(&name).await?);
        }

        Ok(consumers)
    }

    /// Builds a fresh consumer: a new channel with the configured prefetch
    /// window and the next tag number.
    pub(crate) async fn create_consumer(&mut self, name: &str) -> Result<Consumer, RabbidsError> {
        let config = self
            .config
            .consumers
            .get(name)
            .cloned()
            .ok_or_else(|| RabbidsError::UnknownConsumer(name.to_owned()))?;
        let handler = self
            .config
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| RabbidsError::MissingHandler(name.to_owned()))?;

        let channel = self.create_channel(&config.connection).await?;
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|source| RabbidsError::Channel { source })?;

        let number = self.sequence.fetch_add(1, Ordering::Relaxed);
        debug!(consumer = %name, number, "creating consumer");

        Ok(Consumer::new(name, number, &config, handler, channel))
    }

    /// Opens a channel on the named connection, transparently reopening the
    /// connection when the broker dropped it.
    pub(crate) async fn create_channel(
        &mut self,
        connection_name: &str,
    ) -> Result<lapin::Channel, RabbidsError> {
        let conf = self
            .config
            .connections
            .get(connection_name)
            .cloned()
            .ok_or_else(|| RabbidsError::UnknownConnection(connection_name.to_owned()))?;

        let reopen = match self.connections.get(connection_name) {
            Some(connection) => !connection.status().connected(),
            None => true,
        };

        if reopen {
            debug!(connection = %connection_name, "connection is closed, reopening");
            let connection =
                open_connection(&conf, connection_name, &format!("rabbids.{connection_name}"))
                    .await?;
            self.connections.insert(connection_name.to_owned(), connection);
        }

        let connection = self
            .connections
            .get(connection_name)
            .ok_or_else(|| RabbidsError::UnknownConnection(connection_name.to_owned()))?;

        connection
            .create_channel()
            .await
            .map_err(|source| RabbidsError::Channel { source })
    }
}
