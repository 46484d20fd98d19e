//! Leaf output drivers: stdout, file, drop, reject

use super::Output;
use crate::interp::Template;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use virta_core::{Error, MessageBatch, Result};

/// Config fields accepted by the `file` output.
pub const FILE_CONFIG_FIELDS: &[&str] = &["path", "codec"];

/// Config fields accepted by the `reject` output.
pub const REJECT_CONFIG_FIELDS: &[&str] = &["reason"];

/// Prints one line per message to stdout. Debugging aid.
pub struct StdoutOutput;

#[async_trait]
impl Output for StdoutOutput {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_batch(&mut self, batch: &MessageBatch) -> Result<()> {
        use std::io::Write;

        let mut stdout = std::io::stdout().lock();
        for msg in batch.iter() {
            writeln!(stdout, "{}", msg.payload_str().unwrap_or("<binary>"))
                .map_err(|e| Error::Io(format!("stdout write failed: {e}")))?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Configuration for [`FileOutput`].
#[derive(Debug, Clone, Deserialize)]
pub struct FileOutputConfig {
    /// Target path. Parent directories must exist.
    pub path: String,
    /// Payload framing: only `lines` (newline-delimited) is supported.
    #[serde(default = "default_codec")]
    pub codec: String,
}

fn default_codec() -> String {
    "lines".to_string()
}

/// Appends message payloads to a file, newline-delimited.
pub struct FileOutput {
    path: String,
    file: Option<tokio::fs::File>,
}

impl FileOutput {
    /// Build from config. Unknown codecs fail at construction.
    pub fn new(conf: FileOutputConfig) -> Result<Self> {
        if conf.codec != "lines" {
            return Err(Error::Config(format!(
                "unrecognised file codec `{}`",
                conf.codec
            )));
        }
        Ok(Self {
            path: conf.path,
            file: None,
        })
    }
}

#[async_trait]
impl Output for FileOutput {
    async fn connect(&mut self) -> Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::Io(format!("open {}: {e}", self.path)))?;
        self.file = Some(file);
        Ok(())
    }

    async fn write_batch(&mut self, batch: &MessageBatch) -> Result<()> {
        let file = self.file.as_mut().ok_or(Error::NotConnected)?;
        for msg in batch.iter() {
            file.write_all(msg.payload()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Accepts and discards everything. The explicit "drop by policy" sink.
pub struct DropOutput;

#[async_trait]
impl Output for DropOutput {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_batch(&mut self, batch: &MessageBatch) -> Result<()> {
        tracing::trace!(count = batch.len(), "dropping batch by policy");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Configuration for [`RejectOutput`].
#[derive(Debug, Clone, Deserialize)]
pub struct RejectOutputConfig {
    /// Interpolated error message, evaluated against the first message of
    /// the batch.
    pub reason: String,
}

/// Fails every batch with an interpolated reason. Steers messages back
/// through nack-handling wrappers, typically under an error-routing broker.
pub struct RejectOutput {
    reason: Template,
}

impl RejectOutput {
    /// Build from config; the reason template lints at construction.
    pub fn new(conf: RejectOutputConfig) -> Result<Self> {
        Ok(Self {
            reason: Template::parse(&conf.reason)?,
        })
    }
}

#[async_trait]
impl Output for RejectOutput {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_batch(&mut self, batch: &MessageBatch) -> Result<()> {
        let reason = batch
            .get(0)
            .map(|msg| self.reason.render(msg))
            .transpose()?
            .unwrap_or_else(|| "batch rejected".to_string());
        Err(Error::Permanent(reason))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_output_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        let mut out = FileOutput::new(FileOutputConfig {
            path: path.to_string_lossy().into_owned(),
            codec: "lines".into(),
        })
        .unwrap();

        out.connect().await.unwrap();
        out.write_batch(&MessageBatch::from_payloads(["a", "b"]))
            .await
            .unwrap();
        out.write_batch(&MessageBatch::from_payloads(["c"]))
            .await
            .unwrap();
        out.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "a\nb\nc\n");
    }

    #[tokio::test]
    async fn file_output_write_before_connect_is_not_connected() {
        let mut out = FileOutput::new(FileOutputConfig {
            path: "/tmp/never-opened".into(),
            codec: "lines".into(),
        })
        .unwrap();
        let res = out.write_batch(&MessageBatch::from_payloads(["x"])).await;
        assert_eq!(res, Err(Error::NotConnected));
    }

    #[test]
    fn file_output_rejects_unknown_codec() {
        let res = FileOutput::new(FileOutputConfig {
            path: "/tmp/x".into(),
            codec: "tar".into(),
        });
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn drop_output_accepts_everything() {
        let mut out = DropOutput;
        out.connect().await.unwrap();
        out.write_batch(&MessageBatch::from_payloads(["x"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reject_output_fails_with_rendered_reason() {
        let mut out = RejectOutput::new(RejectOutputConfig {
            reason: r#"bad record ${! json("id") }"#.into(),
        })
        .unwrap();
        out.connect().await.unwrap();

        let res = out
            .write_batch(&MessageBatch::from_payloads([r#"{"id":7}"#]))
            .await;
        assert_eq!(res, Err(Error::Permanent("bad record 7".into())));
    }
}
