// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # Supervisor
//!
//! A polling watchdog over the consumers. Topology is declared up front
//! (failure-fatal), every consumer with a registered handler is started,
//! and a ticker replaces any consumer found dead with a fresh one on a new
//! channel and tag number. As long as the broker is reachable, every
//! configured consumer is alive again within one tick of its death.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::client::Rabbids;
use crate::errors::RabbidsError;

/// Handle over the supervision task. Stopping consumes it, so the shutdown
/// path can only run once.
pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Declares the topology, spawns all consumers and starts the watchdog
/// ticking at `interval`.
pub async fn start_supervisor(
    mut client: Rabbids,
    interval: Duration,
) -> Result<Supervisor, RabbidsError> {
    client.declare_topology().await?;

    let mut consumers = client.create_consumers().await?;
    for consumer in &mut consumers {
        consumer.run();
    }

    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    for slot in consumers.iter_mut() {
                        if slot.alive() {
                            continue;
                        }

                        let name = slot.name().to_owned();
                        warn!(consumer = %name, "consumer is dead, replacing it");

                        match client.create_consumer(&name).await {
                            Ok(mut fresh) => {
                                fresh.run();
                                *slot = fresh;
                            }
                            Err(err) => {
                                error!(consumer = %name, error = %err, "failed to replace the consumer");
                            }
                        }
                    }
                }
            }
        }

        for consumer in consumers.iter_mut() {
            consumer.kill().await;
        }

        debug!("supervisor stopped");
    });

    Ok(Supervisor { shutdown, handle })
}

impl Supervisor {
    /// Stops the ticker, signals every consumer to die and waits for all of
    /// them to drain their worker pools.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);

        if let Err(err) = self.handle.await {
            error!(error = %err, "supervisor task panicked");
        }
    }
}
