// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # Producer Runtime
//!
//! A high-level publisher with an asynchronous emit pipeline. One internal
//! task drains the emit channel and reconnects on connection loss; publishes
//! run under a shared read lock so they block only while the reconnect
//! writer holds the connection.
//!
//! Errors from the asynchronous path come back through a bounded error
//! channel. WARNING: when that buffer is full, new errors are dropped so the
//! internal loop never stalls.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lapin::options::BasicPublishOptions;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{Config, Connection, DEFAULT_RETRIES, DEFAULT_SLEEP, DEFAULT_TIMEOUT};
use crate::connection::open_connection;
use crate::delay::{calculate_routing_key, DelayDelivery};
use crate::errors::RabbidsError;
use crate::message::{Publishing, PublishingError};
use crate::otel;
use crate::serialization::{Json, Serializer};
use crate::topology::Declarations;

/// Capacity of the emit and emit-err channels.
const EMIT_CAPACITY: usize = 250;
/// Publish attempts before one message is given up on.
const SEND_RETRIES: usize = 10;
/// Sleep between publish attempts.
const SEND_RETRY_SLEEP: Duration = Duration::from_millis(10);
/// Sleep between reconnection attempts. The reconnect loop has no upper
/// bound; it keeps trying for as long as the producer is alive.
const RECONNECT_SLEEP: Duration = Duration::from_secs(1);

/// A high-level RabbitMQ producer.
///
/// Obtain one through [`Producer::new`] or [`Producer::builder`]. Dropping
/// the producer without calling [`Producer::close`] leaves the internal
/// loop running until every emit sender is gone.
pub struct Producer {
    core: Arc<Core>,
    emit: mpsc::Sender<Publishing>,
    emit_err: Option<mpsc::Receiver<PublishingError>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Assembles a [`Producer`] step by step.
pub struct ProducerBuilder {
    conf: Connection,
    name: String,
    serializer: Box<dyn Serializer>,
    config: Option<Config>,
}

impl Producer {
    /// Connects a producer with the default settings: JSON serialization,
    /// no lazy declarations.
    pub async fn new(dsn: impl Into<String>) -> Result<Producer, RabbidsError> {
        Producer::builder(dsn).connect().await
    }

    pub fn builder(dsn: impl Into<String>) -> ProducerBuilder {
        ProducerBuilder {
            conf: Connection {
                dsn: dsn.into(),
                timeout: DEFAULT_TIMEOUT,
                sleep: DEFAULT_SLEEP,
                retries: DEFAULT_RETRIES,
            },
            name: format!("rabbids.producer.{}", unix_timestamp()),
            serializer: Box::new(Json),
            config: None,
        }
    }

    /// Hands out a sender into the emit pipeline. Sends do not wait for the
    /// broker; failures surface on [`Producer::emit_err`]. The channel is
    /// bounded at 250 messages.
    pub fn emit(&self) -> mpsc::Sender<Publishing> {
        self.emit.clone()
    }

    /// Takes the error channel for the asynchronous path. Returns `Some`
    /// only on the first call. The buffer is bounded at 250 errors and
    /// overflow is dropped, never blocking the producer.
    ///
    /// After [`Producer::close`] the channel is closed without being
    /// drained; late readers may find it empty.
    pub fn emit_err(&mut self) -> Option<mpsc::Receiver<PublishingError>> {
        self.emit_err.take()
    }

    /// Publishes synchronously, returning the final error after the bounded
    /// retries. While a reconnect is in progress the publish blocks until
    /// the new connection is installed.
    pub async fn send(&self, message: Publishing) -> Result<(), RabbidsError> {
        self.core.send(message).await.map_err(|failure| failure.error)
    }

    /// Returns a clone of the channel currently used to publish, for
    /// advanced use next to the high-level surface.
    pub async fn channel(&self) -> Channel {
        self.core.state.read().await.channel.clone()
    }

    /// Stops the internal loop, drains the emits already buffered, then
    /// closes the channel and the connection. Emit senders still held by
    /// callers observe send errors afterwards.
    pub async fn close(mut self) -> Result<(), RabbidsError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "producer loop panicked");
            }
        }

        let state = self.core.state.write().await;
        if state.connection.status().connected() {
            state
                .channel
                .close(200, "")
                .await
                .map_err(|source| RabbidsError::Close { source })?;
            state
                .connection
                .close(200, "")
                .await
                .map_err(|source| RabbidsError::Close { source })?;
        }

        Ok(())
    }
}

impl ProducerBuilder {
    /// Overrides the connection name advertised to the broker.
    pub fn name(mut self, name: impl Into<String>) -> ProducerBuilder {
        self.name = name.into();
        self
    }

    /// Replaces the default JSON serializer.
    pub fn serializer(mut self, serializer: impl Serializer + 'static) -> ProducerBuilder {
        self.serializer = Box::new(serializer);
        self
    }

    /// Enables lazy exchange declaration: the first publish to each
    /// exchange present in `config` declares it. Unknown exchange names are
    /// skipped and left for the broker to reject.
    pub fn declarations(mut self, config: Config) -> ProducerBuilder {
        self.config = Some(config);
        self
    }

    pub async fn connect(self) -> Result<Producer, RabbidsError> {
        let (notify_tx, notify_rx) = mpsc::channel(4);
        let state = Core::open_state(&self.conf, &self.name, &notify_tx).await?;

        let core = Arc::new(Core {
            conf: self.conf,
            name: self.name,
            serializer: self.serializer,
            declarations: self.config.map(|c| Declarations::new(Arc::new(c))),
            declared: Mutex::new(HashSet::new()),
            delay: DelayDelivery::default(),
            state: RwLock::new(state),
        });

        let (emit_tx, emit_rx) = mpsc::channel(EMIT_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(EMIT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(producer_loop(
            core.clone(),
            emit_rx,
            err_tx,
            notify_rx,
            notify_tx,
            shutdown_rx,
        ));

        Ok(Producer {
            core,
            emit: emit_tx,
            emit_err: Some(err_rx),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }
}

struct Core {
    conf: Connection,
    name: String,
    serializer: Box<dyn Serializer>,
    declarations: Option<Declarations>,
    declared: Mutex<HashSet<String>>,
    delay: DelayDelivery,
    state: RwLock<State>,
}

struct State {
    connection: lapin::Connection,
    channel: Channel,
}

impl Core {
    async fn open_state(
        conf: &Connection,
        name: &str,
        notify: &mpsc::Sender<lapin::Error>,
    ) -> Result<State, RabbidsError> {
        let connection = open_connection(conf, name, name).await?;

        let tx = notify.clone();
        connection.on_error(move |err| {
            let _ = tx.try_send(err);
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|source| RabbidsError::Channel { source })?;

        Ok(State { connection, channel })
    }

    async fn start_connection(&self, notify: &mpsc::Sender<lapin::Error>) -> Result<(), RabbidsError> {
        debug!(producer = %self.name, "opening a new rabbitmq connection");

        let state = Core::open_state(&self.conf, &self.name, notify).await?;
        *self.state.write().await = state;

        Ok(())
    }

    async fn reconnect(&self, notify: &mpsc::Sender<lapin::Error>) {
        loop {
            match self.start_connection(notify).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(producer = %self.name, error = %err, "amqp reconnection failed");
                    tokio::time::sleep(RECONNECT_SLEEP).await;
                }
            }
        }
    }

    async fn send(&self, mut message: Publishing) -> Result<(), PublishingError> {
        message.apply_options();

        let body = match self.serializer.marshal(&message.data) {
            Ok(body) => body,
            Err(error) => {
                return Err(PublishingError {
                    publishing: message,
                    error,
                })
            }
        };

        if message.delay > Duration::ZERO {
            {
                let state = self.state.read().await;
                if let Err(error) = self.delay.declare(&state.channel, &message.key).await {
                    drop(state);
                    return Err(PublishingError {
                        publishing: message,
                        error,
                    });
                }
            }

            // Steer the message into the cascade instead of the requested
            // exchange; it exits towards the original key on its own.
            let (key, exchange) = calculate_routing_key(message.delay, &message.key);
            message.key = key;
            message.exchange = exchange;
        }

        let properties = self.stamp(&message);

        let mut attempts = 0;
        loop {
            let state = self.state.read().await;
            self.try_declare_exchange(&state.channel, &message.exchange).await;

            let result = state
                .channel
                .basic_publish(
                    &message.exchange,
                    &message.key,
                    BasicPublishOptions::default(),
                    &body,
                    properties.clone(),
                )
                .await;
            drop(state);

            match result {
                Ok(_confirm) => return Ok(()),
                Err(source) => {
                    attempts += 1;
                    if attempts >= SEND_RETRIES {
                        return Err(PublishingError {
                            publishing: message,
                            error: RabbidsError::Publish { attempts, source },
                        });
                    }
                    tokio::time::sleep(SEND_RETRY_SLEEP).await;
                }
            }
        }
    }

    /// Stamps the serializer's content type, a message id when none was
    /// set, and the current trace context onto the properties.
    fn stamp(&self, message: &Publishing) -> BasicProperties {
        let properties = message.properties.clone();

        let mut headers = properties.headers().clone().unwrap_or_default().inner().clone();
        otel::inject_context(&mut headers);

        let mut properties = properties
            .with_content_type(ShortString::from(self.serializer.name()))
            .with_headers(FieldTable::from(headers));

        if properties.message_id().is_none() {
            properties =
                properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()));
        }

        properties
    }

    async fn try_declare_exchange(&self, channel: &Channel, exchange: &str) {
        let Some(declarations) = &self.declarations else {
            return;
        };
        if exchange.is_empty() {
            return;
        }

        let mut declared = self.declared.lock().await;
        if declared.contains(exchange) {
            return;
        }

        match declarations.declare_exchange(channel, exchange).await {
            Ok(_) => {
                declared.insert(exchange.to_owned());
            }
            Err(err) => {
                warn!(exchange, error = %err, "failed to declare the exchange before publishing");
            }
        }
    }
}

async fn producer_loop(
    core: Arc<Core>,
    mut emit: mpsc::Receiver<Publishing>,
    errors: mpsc::Sender<PublishingError>,
    mut notify: mpsc::Receiver<lapin::Error>,
    notify_tx: mpsc::Sender<lapin::Error>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                // Refuse new emits but drain whatever is already buffered.
                emit.close();
                while let Some(message) = emit.recv().await {
                    if let Err(failure) = core.send(message).await {
                        try_emit_err(&errors, failure);
                    }
                }
                return;
            }
            Some(err) = notify.recv() => {
                if core.state.read().await.connection.status().connected() {
                    debug!(producer = %core.name, error = %err, "stale close notification, ignoring");
                } else {
                    warn!(producer = %core.name, error = %err, "amqp connection closed");
                    core.reconnect(&notify_tx).await;
                }
            }
            maybe = emit.recv() => match maybe {
                Some(message) => {
                    if let Err(failure) = core.send(message).await {
                        try_emit_err(&errors, failure);
                    }
                }
                // Every sender is gone; nothing more will ever arrive.
                None => return,
            },
        }
    }
}

fn try_emit_err(errors: &mpsc::Sender<PublishingError>, failure: PublishingError) {
    match errors.try_send(failure) {
        Ok(()) => {}
        Err(TrySendError::Full(dropped)) => {
            warn!(error = %dropped, "emit-err buffer is full, dropping publishing error");
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
