// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error types for every rabbids operation.
//! `RabbidsError` covers the runtime surface (connections, topology,
//! consuming, publishing) and `ConfigError` covers everything that can go
//! wrong while loading the declarative YAML configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Represents errors that can occur while operating against the broker.
///
/// Synchronous APIs (`Rabbids::new`, `start_supervisor`, `Producer::send`,
/// `Producer::close`) return these directly. The asynchronous emit pipeline
/// surfaces them wrapped in a [`PublishingError`](crate::PublishingError)
/// through the producer's error channel.
#[derive(Error, Debug)]
pub enum RabbidsError {
    /// Opening a connection failed after all the configured retries.
    #[error("error opening the connection \"{name}\": {source}")]
    ConnectionOpen {
        name: String,
        #[source]
        source: lapin::Error,
    },

    /// The dial did not complete within the configured timeout.
    #[error("error opening the connection \"{name}\": timed out after {timeout:?}")]
    ConnectionTimeout { name: String, timeout: Duration },

    /// Error creating a channel from an established connection.
    #[error("failure to create a channel: {source}")]
    Channel {
        #[source]
        source: lapin::Error,
    },

    /// An exchange, queue or binding declaration was refused by the broker.
    #[error("failed to declare {entity}: {source}")]
    Topology {
        entity: String,
        #[source]
        source: lapin::Error,
    },

    /// A consumer references a connection name absent from the configuration.
    #[error("unknown connection \"{0}\"")]
    UnknownConnection(String),

    /// A consumer name absent from the configuration was requested.
    #[error("unknown consumer \"{0}\"")]
    UnknownConsumer(String),

    /// A consumer was started without a registered message handler.
    #[error("no handler registered for consumer \"{0}\"")]
    MissingHandler(String),

    /// `basic_consume` was refused by the broker.
    #[error("failed to start consuming from \"{queue}\": {source}")]
    Consume {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    /// The broker closed the consumer channel (e.g. precondition failed).
    #[error("consumer channel closed by the broker: {source}")]
    ChannelClosed {
        #[source]
        source: lapin::Error,
    },

    /// The delivery stream ended without a broker error.
    #[error("internal channel closed")]
    InternalChannelClosed,

    /// The configured serializer refused the payload.
    #[error("failed to marshal: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Publishing kept failing after the bounded retries.
    #[error("failed to publish after {attempts} attempts: {source}")]
    Publish {
        attempts: usize,
        #[source]
        source: lapin::Error,
    },

    /// Closing the producer's channel or connection failed.
    #[error("error closing the producer: {source}")]
    Close {
        #[source]
        source: lapin::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors produced while loading the YAML configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Anything that is not `.yml`/`.yaml`.
    #[error("file extension {0:?} not supported")]
    UnsupportedExtension(String),

    /// A `${NAME}` reference without a default and without a value in the
    /// environment.
    #[error("required environment variable {0} is not set")]
    MissingEnvVar(String),

    #[error("failed to decode the yaml configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_open_error_keeps_the_documented_prefix() {
        let err = RabbidsError::ConnectionOpen {
            name: "default".to_owned(),
            source: lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closed),
        };

        assert!(err
            .to_string()
            .starts_with("error opening the connection \"default\": "));
    }

    #[test]
    fn timeout_error_uses_the_same_prefix() {
        let err = RabbidsError::ConnectionTimeout {
            name: "default".to_owned(),
            timeout: Duration::from_secs(2),
        };

        assert!(err
            .to_string()
            .starts_with("error opening the connection \"default\": "));
    }
}
