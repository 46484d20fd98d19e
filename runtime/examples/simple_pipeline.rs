//! Minimal virta stream — demonstrates the runtime API.
//!
//! ```bash
//! cargo run -p virta-runtime --example simple_pipeline
//! ```

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    virta_runtime::run_from_str(
        r#"{
            "input": {
                "generate": {
                    "mapping": "root.id = uuid_v4()\nroot.n = count(\"example\")",
                    "interval": "1s"
                }
            },
            "pipeline": {
                "processors": [
                    {"mapping": "root.wrapped = json(\"n\")"}
                ]
            },
            "output": {"stdout": {}},
            "system_close_timeout": "5s"
        }"#,
    )
    .await
}
