// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! The capability interface implemented by message consumers, plus an
//! adapter for plain closures.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::message::Message;

/// Processes deliveries for one consumer.
///
/// The handler owns the delivery once called and must settle it (ack, nack
/// or reject) unless the consumer runs with `auto_ack`. Leaving a delivery
/// unsettled keeps it outstanding on the broker until the channel closes.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message);

    /// Called exactly once, after the worker pool drained, when the
    /// consumer shuts down gracefully.
    async fn close(&self) {}
}

/// Adapts a closure returning a boxed future into a [`MessageHandler`].
///
/// ```no_run
/// use futures_util::FutureExt;
/// use rabbids::MessageHandlerFunc;
///
/// let handler = MessageHandlerFunc::new(|message| {
///     async move {
///         let _ = message.ack(false).await;
///     }
///     .boxed()
/// });
/// ```
pub struct MessageHandlerFunc<F> {
    handler: F,
}

impl<F> MessageHandlerFunc<F>
where
    F: Fn(Message) -> BoxFuture<'static, ()> + Send + Sync,
{
    pub fn new(handler: F) -> Arc<MessageHandlerFunc<F>> {
        Arc::new(MessageHandlerFunc { handler })
    }
}

#[async_trait]
impl<F> MessageHandler for MessageHandlerFunc<F>
where
    F: Fn(Message) -> BoxFuture<'static, ()> + Send + Sync,
{
    async fn handle(&self, message: Message) {
        (self.handler)(message).await;
    }
}
