//! Runtime orchestration: wires the configuration, the queue driver, and
//! the session registry together, and owns the shutdown signal.

use crate::core::config::Config;
use crate::core::time::Clock;
use crate::group::mapping::ClientSessionGroupMapping;
use crate::queue::QueueDriver;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;

/// Fires the engine-wide shutdown signal. Cheap to clone and hand out.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// The assembled engine. `run` blocks until the shutdown signal fires,
/// then drains sessions and groups before returning.
pub struct Runtime<C: Clock> {
    config: Arc<Config>,
    mapping: Arc<ClientSessionGroupMapping<C>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<C: Clock> Runtime<C> {
    pub fn new(config: Config, clock: C, driver: Arc<dyn QueueDriver>) -> Self {
        let config = Arc::new(config);
        let mapping = ClientSessionGroupMapping::new(config.clone(), clock, driver);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            mapping,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mapping(&self) -> &Arc<ClientSessionGroupMapping<C>> {
        &self.mapping
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run sweeps until shutdown fires, then drain the registry.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            cluster = %self.config.server.cluster,
            env = %self.config.server.env,
            "meshbus runtime starting"
        );
        let sweepers = self.mapping.spawn_sweepers(self.shutdown_rx.clone());
        let mut shutdown_rx = self.shutdown_rx.clone();
        // A closed channel means the sender side is gone; treat it as shutdown.
        let _ = shutdown_rx.changed().await;
        self.mapping.shutdown().await;
        for task in sweepers {
            let _ = task.await;
        }
        tracing::info!("meshbus runtime stopped");
        Ok(())
    }

    /// Like `run`, with ctrl-c wired to the shutdown signal.
    pub async fn run_until_signal(&self) -> Result<()> {
        let handle = self.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                handle.trigger();
            }
        });
        self.run().await
    }
}
