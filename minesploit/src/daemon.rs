//! Daemon lifecycle for the long-running roles.
//!
//! Runs a pool or relay, plus the optional HTTP API, as tracked tasks under
//! one cancellation token, and shuts everything down on SIGINT or SIGTERM.

use std::future::Future;
use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::api::{self, ApiConfig};
use crate::pool::Pool;
use crate::relay::Relay;
use crate::stats::Stats;
use crate::tracing::prelude::*;

/// The component a daemon serves.
pub enum Service {
    Pool(Pool),
    Relay(Relay),
}

impl Service {
    fn stats(&self) -> Arc<Stats> {
        match self {
            Service::Pool(pool) => pool.stats(),
            Service::Relay(relay) => relay.stats(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Service::Pool(_) => "pool",
            Service::Relay(_) => "relay",
        }
    }
}

/// Owns the shutdown token and task tracker for one run.
pub struct Daemon {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    api: Option<ApiConfig>,
}

impl Daemon {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            api: None,
        }
    }

    /// Also serve the stats API.
    pub fn with_api(mut self, config: ApiConfig) -> Self {
        self.api = Some(config);
        self
    }

    /// Run `service` until a termination signal arrives.
    pub async fn run(self, service: Service) -> anyhow::Result<()> {
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        self.run_until(service, async move {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        })
        .await
    }

    /// Run `service` until `stop` completes or the service exits on its own.
    pub(crate) async fn run_until(
        self,
        service: Service,
        stop: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let name = service.name();
        let stats = service.stats();

        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move {
                let result = match service {
                    Service::Pool(pool) => pool.run(shutdown.clone()).await,
                    Service::Relay(relay) => relay.run(shutdown.clone()).await,
                };
                if let Err(e) = result {
                    error!(service = name, error = %e, "Service failed");
                }
                // Whatever the reason, nothing is left to serve
                shutdown.cancel();
            }
        });

        if let Some(config) = self.api.clone() {
            self.tracker.spawn({
                let shutdown = self.shutdown.clone();
                async move {
                    if let Err(e) = api::serve(config, shutdown.clone(), stats).await {
                        error!(error = %e, "API server failed");
                    }
                }
            });
        }
        self.tracker.close();

        info!(service = name, "Started.");

        tokio::select! {
            _ = stop => {}
            _ = self.shutdown.cancelled() => {}
        }

        trace!("Shutting down.");
        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::relay::{RelayConfig, RelayPolicy};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_stop_shuts_down_service_and_api() {
        let pool = Pool::bind(PoolConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        let addr = pool.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let daemon = Daemon::new().with_api(ApiConfig {
            bind_addr: "127.0.0.1:0".to_string(),
        });
        let handle = tokio::spawn(daemon.run_until(Service::Pool(pool), async move {
            let _ = stop_rx.await;
        }));

        tokio::net::TcpStream::connect(addr).await.unwrap();
        stop_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_api_bind_failure_does_not_stop_relay() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = Relay::bind(
            RelayConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                upstream_addr: "127.0.0.1:1".to_string(),
                ..Default::default()
            },
            RelayPolicy::transparent(),
        )
        .await
        .unwrap();
        let addr = relay.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let daemon = Daemon::new().with_api(ApiConfig {
            bind_addr: taken.local_addr().unwrap().to_string(),
        });
        let handle = tokio::spawn(daemon.run_until(Service::Relay(relay), async move {
            let _ = stop_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
