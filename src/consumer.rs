// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # Consumer Runtime
//!
//! One task per configured consumer drains deliveries into a fixed-size
//! worker pool. Submission into a saturated pool blocks the drain loop,
//! which is the back-pressure mechanism keeping the number of concurrently
//! running handlers at `workers` while the broker caps in-flight unacked
//! deliveries at `prefetch_count`.
//!
//! A consumer dies on any channel error and stays dead; reviving it with a
//! fresh channel and a new tag number is the supervisor's job.

use std::sync::Arc;

use futures_util::StreamExt;
use lapin::options::BasicConsumeOptions;
use lapin::Channel;
use opentelemetry::global;
use opentelemetry::trace::Span;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::{ConsumerConfig, Options};
use crate::errors::RabbidsError;
use crate::handler::MessageHandler;
use crate::message::Message;
use crate::{otel, topology};

/// A running subscription on one queue, owning one AMQP channel.
pub struct Consumer {
    name: String,
    tag: String,
    queue: String,
    options: Options,
    workers: usize,
    handler: Arc<dyn MessageHandler>,
    channel: Channel,
    dying: watch::Sender<bool>,
    dying_rx: Option<watch::Receiver<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Consumer {
    pub(crate) fn new(
        name: &str,
        number: i64,
        config: &ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
        channel: Channel,
    ) -> Consumer {
        let (dying, dying_rx) = watch::channel(false);

        Consumer {
            name: name.to_owned(),
            tag: consumer_tag(name, number),
            queue: config.queue.name.clone(),
            options: config.options.clone(),
            workers: config.workers,
            handler,
            channel,
            dying,
            dying_rx: Some(dying_rx),
            handle: None,
        }
    }

    /// Starts the consume loop. Non-blocking; calling it twice is a no-op.
    pub fn run(&mut self) {
        let Some(dying) = self.dying_rx.take() else {
            return;
        };

        let name = self.name.clone();
        let channel = self.channel.clone();
        let queue = self.queue.clone();
        let tag = self.tag.clone();
        let options = self.options.clone();
        let workers = self.workers;
        let handler = self.handler.clone();

        self.handle = Some(tokio::spawn(async move {
            match consume_loop(&channel, &queue, &tag, options, workers, handler, dying).await {
                Ok(()) => debug!(consumer = %name, "consumer stopped"),
                Err(err) => error!(consumer = %name, error = %err, "consumer died"),
            }

            if let Err(err) = channel.close(200, "").await {
                warn!(consumer = %name, error = %err, "error closing the consumer channel");
            }
        }));
    }

    /// Signals the loop to stop and blocks until it is dead. In-flight
    /// workers run to completion first.
    pub async fn kill(&mut self) {
        let _ = self.dying.send(true);

        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!(consumer = %self.name, error = %err, "consumer task panicked");
            }
        }
    }

    /// Whether the consume loop is still running.
    pub fn alive(&self) -> bool {
        match &self.handle {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The broker-visible consumer tag, `rabbitmq-<name>-<n>`.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

async fn consume_loop(
    channel: &Channel,
    queue: &str,
    tag: &str,
    options: Options,
    workers: usize,
    handler: Arc<dyn MessageHandler>,
    mut dying: watch::Receiver<bool>,
) -> Result<(), RabbidsError> {
    let mut deliveries = channel
        .basic_consume(
            queue,
            tag,
            BasicConsumeOptions {
                no_local: options.no_local,
                no_ack: options.auto_ack,
                exclusive: options.exclusive,
                nowait: options.no_wait,
            },
            topology::field_table(&options.args),
        )
        .await
        .map_err(|source| RabbidsError::Consume {
            queue: queue.to_owned(),
            source,
        })?;

    let pool = Arc::new(Semaphore::new(workers));
    let tracer = global::tracer("rabbids.consumer");

    loop {
        tokio::select! {
            _ = dying.changed() => {
                // Wait for any remaining worker, then let the handler
                // release its resources.
                let _ = pool.acquire_many(workers as u32).await;
                handler.close().await;
                return Ok(());
            }
            delivery = deliveries.next() => match delivery {
                Some(Ok(delivery)) => {
                    // Blocks while every worker is busy. This is the
                    // back-pressure keeping handler concurrency at
                    // `workers` under the broker's prefetch window.
                    let Ok(permit) = pool.clone().acquire_owned().await else {
                        return Err(RabbidsError::InternalChannelClosed);
                    };

                    let handler = handler.clone();
                    let mut span =
                        otel::consumer_span(&tracer, &delivery.properties, delivery.routing_key.as_str());

                    tokio::spawn(async move {
                        handler.handle(Message::new(delivery)).await;
                        span.end();
                        drop(permit);
                    });
                }
                Some(Err(source)) => return Err(RabbidsError::ChannelClosed { source }),
                None => return Err(RabbidsError::InternalChannelClosed),
            },
        }
    }
}

pub(crate) fn consumer_tag(name: &str, number: i64) -> String {
    format!("rabbitmq-{name}-{number}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_encode_the_name_and_the_sequence_number() {
        assert_eq!(consumer_tag("messaging_consumer", 1), "rabbitmq-messaging_consumer-1");
        assert_eq!(consumer_tag("send", 42), "rabbitmq-send-42");
    }
}
