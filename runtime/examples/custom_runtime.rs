//! Power-user example — streams mode with a shared dedupe cache.
//!
//! ```bash
//! cargo run -p virta-runtime --example custom_runtime
//! ```

use std::time::Duration;
use virta_runtime::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    virta_runtime::init_tracing(&virta_engine::config::LoggerConfig::default());

    let mgr = Manager::new(Environment::with_builtins()?);
    mgr.store_cache("seen", std::sync::Arc::new(MemoryCache::default()));

    let mut supervisor = StreamsSupervisor::new(mgr)
        .with_deadlines(Duration::ZERO, Duration::from_secs(5));

    let conf: StreamConfig = serde_json::from_str(
        r#"{
            "input": {"generate": {"mapping": "root.n = count(\"demo\")", "interval": "500ms"}},
            "pipeline": {
                "processors": [
                    {"dedupe": {"cache": "seen", "key": "${! json(\"n\") }"}}
                ]
            },
            "output": {"stdout": {}}
        }"#,
    )?;
    supervisor.set("demo", &conf).await?;

    virta_runtime::shutdown_signal().await;
    supervisor.stop_all().await?;
    Ok(())
}
