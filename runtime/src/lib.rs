//! virta-runtime — embedding layer for the stream engine
//!
//! Provides [`run()`] for zero-boilerplate daemon startup from a config
//! document, and [`StreamsSupervisor`] for hosting many streams in one
//! process ("streams mode") with add/replace/remove at runtime.
//!
//! # Quick start
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let raw = std::fs::read_to_string("config.json")?;
//!     virta_runtime::run_from_str(&raw).await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod prelude;

use std::collections::HashMap;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use virta_engine::config::LoggerConfig;
use virta_engine::{EngineConfig, Environment, Manager, Metrics, Stream, StreamConfig};

/// Parse a raw config document and run it to completion.
///
/// Environment references (`${VAR}`) resolve before parsing; a parse or
/// lint failure returns an error before anything starts, which the binary
/// maps to exit code 1.
pub async fn run_from_str(raw: &str) -> anyhow::Result<()> {
    let conf = EngineConfig::from_str(raw)?;
    run(conf).await
}

/// Run one configured stream until SIGINT/SIGTERM (or until a finite
/// input completes), then shut down within the configured deadlines.
///
/// A shutdown that misses `system_close_timeout` returns an error after
/// dumping the task state, which the binary maps to exit code 1.
pub async fn run(conf: EngineConfig) -> anyhow::Result<()> {
    init_tracing(&conf.logger);

    let env = Environment::with_builtins()?;
    let mgr = Manager::new(env);

    Metrics::init()?;
    mgr.build_resources(&conf.resources)?;

    let stream = Stream::new(&conf.stream, &mgr)?;

    // Admin surface, torn down together with the stream.
    let (admin_stop_tx, admin_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let admin = if conf.http.enabled {
        let router = virta_engine::api::router(mgr.clone());
        let address = conf.http.address.clone();
        Some(tokio::spawn(async move {
            let shutdown = async {
                let _ = admin_stop_rx.await;
            };
            if let Err(err) = virta_engine::api::serve(router, &address, shutdown).await {
                tracing::error!(error = %err, "admin server failed");
            }
        }))
    } else {
        None
    };

    shutdown_signal().await;

    let res = stream
        .stop(conf.system_close_delay, conf.system_close_timeout)
        .await;

    let _ = admin_stop_tx.send(());
    if let Some(admin) = admin {
        let _ = admin.await;
    }
    mgr.clear_resources();

    res?;
    info!("virta shutdown complete");
    Ok(())
}

/// Initialise the tracing subscriber from logger config.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(conf: &LoggerConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| conf.level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if conf.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    // Already-initialised is fine (tests, embedders with their own setup).
    let _ = result;
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// Hosts many named streams in one process.
///
/// Streams share the supervisor's manager (and therefore its named
/// resources); each is assembled and torn down independently. Adding a
/// stream under an existing id replaces it, draining the old one first.
pub struct StreamsSupervisor {
    mgr: Manager,
    streams: HashMap<String, Stream>,
    close_delay: Duration,
    close_timeout: Duration,
}

impl StreamsSupervisor {
    /// A supervisor over a shared manager.
    pub fn new(mgr: Manager) -> Self {
        Self {
            mgr,
            streams: HashMap::new(),
            close_delay: Duration::ZERO,
            close_timeout: Duration::from_secs(20),
        }
    }

    /// Override the shutdown deadlines applied to every stream.
    pub fn with_deadlines(mut self, close_delay: Duration, close_timeout: Duration) -> Self {
        self.close_delay = close_delay;
        self.close_timeout = close_timeout;
        self
    }

    /// The supervisor's manager, for registering shared resources.
    pub fn manager(&self) -> &Manager {
        &self.mgr
    }

    /// Ids of the hosted streams.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Create (or replace) the stream under `id`.
    pub async fn set(&mut self, id: &str, conf: &StreamConfig) -> virta_core::Result<()> {
        if let Some(old) = self.streams.remove(id) {
            info!(stream = %id, "draining replaced stream");
            old.stop(self.close_delay, self.close_timeout).await?;
        }
        let stream = Stream::new(conf, &self.mgr.into_path(&[id]))?;
        self.streams.insert(id.to_string(), stream);
        info!(stream = %id, "stream started");
        Ok(())
    }

    /// Stop and remove the stream under `id`.
    pub async fn remove(&mut self, id: &str) -> virta_core::Result<()> {
        let stream = self
            .streams
            .remove(id)
            .ok_or_else(|| virta_core::Error::ResourceMissing(id.to_string()))?;
        stream.stop(self.close_delay, self.close_timeout).await
    }

    /// Stop every stream, reporting the first failure after attempting
    /// all of them.
    pub async fn stop_all(mut self) -> virta_core::Result<()> {
        let mut first_err = None;
        let ids = self.list();
        for id in ids {
            if let Some(stream) = self.streams.remove(&id) {
                if let Err(err) = stream.stop(self.close_delay, self.close_timeout).await {
                    tracing::error!(stream = %id, error = %err, "stream failed to stop cleanly");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn stream_conf(path: &std::path::Path, count: usize) -> StreamConfig {
        serde_json::from_value(serde_json::json!({
            "input": {"generate": {"mapping": "root.id = \"x\"", "count": count}},
            "output": {"file": {"path": path.to_string_lossy(), "codec": "lines"}},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn supervisor_hosts_and_stops_streams() {
        let mgr = Manager::for_tests();
        let mut supervisor = StreamsSupervisor::new(mgr)
            .with_deadlines(Duration::ZERO, Duration::from_secs(5));

        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jsonl");
        let b = dir.path().join("b.jsonl");

        supervisor.set("a", &stream_conf(&a, 0)).await.unwrap();
        supervisor.set("b", &stream_conf(&b, 0)).await.unwrap();
        assert_eq!(supervisor.list(), vec!["a", "b"]);

        tokio::time::sleep(Duration::from_millis(50)).await;

        supervisor.remove("a").await.unwrap();
        assert_eq!(supervisor.list(), vec!["b"]);
        assert!(matches!(
            supervisor.remove("a").await,
            Err(virta_core::Error::ResourceMissing(_))
        ));

        supervisor.stop_all().await.unwrap();

        assert!(!std::fs::read_to_string(&a).unwrap().is_empty());
        assert!(!std::fs::read_to_string(&b).unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_replaces_and_drains() {
        let mgr = Manager::for_tests();
        let mut supervisor = StreamsSupervisor::new(mgr)
            .with_deadlines(Duration::ZERO, Duration::from_secs(5));

        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.jsonl");
        let second = dir.path().join("second.jsonl");

        supervisor.set("s", &stream_conf(&first, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        supervisor.set("s", &stream_conf(&second, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        supervisor.stop_all().await.unwrap();

        assert!(!std::fs::read_to_string(&first).unwrap().is_empty());
        assert!(!std::fs::read_to_string(&second).unwrap().is_empty());
    }
}
