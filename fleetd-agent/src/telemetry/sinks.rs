use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::client::ControlPlaneClient;
use fleetd_core::capability::Compression;
use fleetd_core::types::{Metric, MetricsUpload};

/// A consumer of telemetry batches.
#[async_trait]
pub trait MetricSink: Send + Sync {
    fn name(&self) -> &str;
    /// Compression this sink accepts; batches are encoded at the sink
    /// boundary when this is not `None`.
    fn compression(&self) -> Compression {
        Compression::None
    }
    async fn handle(&self, batch: &[Metric]) -> Result<()>;
}

/// Encode a batch for upload, applying the requested compression.
/// Returns the body and the content-encoding label, if any.
pub fn encode_batch(
    batch: &[Metric],
    compression: Compression,
) -> Result<(Vec<u8>, Option<&'static str>)> {
    let json = serde_json::to_vec(&MetricsUpload { metrics: batch.to_vec() })?;
    match compression {
        Compression::None => Ok((json, None)),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
            encoder.write_all(&json)?;
            Ok((encoder.finish()?, Some("gzip")))
        }
        Compression::Zstd => {
            let body = zstd::encode_all(json.as_slice(), 0).context("zstd encoding failed")?;
            Ok((body, Some("zstd")))
        }
    }
}

/// Appends batches as JSON lines to `telemetry/metrics.json`.
pub struct LocalFileSink {
    path: PathBuf,
}

impl LocalFileSink {
    pub fn new(data_dir: &PathBuf) -> Self {
        Self { path: data_dir.join("telemetry").join("metrics.json") }
    }
}

#[async_trait]
impl MetricSink for LocalFileSink {
    fn name(&self) -> &str {
        "local-file"
    }

    async fn handle(&self, batch: &[Metric]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut lines = String::new();
        for metric in batch {
            lines.push_str(&serde_json::to_string(metric)?);
            lines.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {:?}", self.path))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, lines.as_bytes()).await?;
        Ok(())
    }
}

/// Uploads batches to the control plane, compressed per the device tier.
pub struct RemoteMetricsSink {
    client: Arc<ControlPlaneClient>,
    compression: Compression,
}

impl RemoteMetricsSink {
    pub fn new(client: Arc<ControlPlaneClient>, compression: Compression) -> Self {
        Self { client, compression }
    }
}

#[async_trait]
impl MetricSink for RemoteMetricsSink {
    fn name(&self) -> &str {
        "control-plane"
    }

    fn compression(&self) -> Compression {
        self.compression
    }

    async fn handle(&self, batch: &[Metric]) -> Result<()> {
        let (body, encoding) = encode_batch(batch, self.compression)?;
        let ack = self.client.send_metrics_raw(body, encoding).await?;
        if !ack.success {
            return Err(anyhow::anyhow!("control plane did not ack metric batch"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn batch() -> Vec<Metric> {
        vec![
            Metric::new("a", 1.0).with_label("host", "h1"),
            Metric::new("b", 2.5),
        ]
    }

    #[test]
    fn gzip_encoding_roundtrips() {
        let (body, encoding) = encode_batch(&batch(), Compression::Gzip).unwrap();
        assert_eq!(encoding, Some("gzip"));

        let mut decoder = flate2::read::GzDecoder::new(body.as_slice());
        let mut json = Vec::new();
        decoder.read_to_end(&mut json).unwrap();
        let upload: MetricsUpload = serde_json::from_slice(&json).unwrap();
        assert_eq!(upload.metrics, batch());
    }

    #[test]
    fn zstd_encoding_roundtrips() {
        let (body, encoding) = encode_batch(&batch(), Compression::Zstd).unwrap();
        assert_eq!(encoding, Some("zstd"));

        let json = zstd::decode_all(body.as_slice()).unwrap();
        let upload: MetricsUpload = serde_json::from_slice(&json).unwrap();
        assert_eq!(upload.metrics, batch());
    }

    #[test]
    fn plain_encoding_is_passthrough_json() {
        let (body, encoding) = encode_batch(&batch(), Compression::None).unwrap();
        assert!(encoding.is_none());
        let upload: MetricsUpload = serde_json::from_slice(&body).unwrap();
        assert_eq!(upload.metrics.len(), 2);
    }

    #[tokio::test]
    async fn local_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalFileSink::new(&dir.path().to_path_buf());
        sink.handle(&batch()).await.unwrap();
        sink.handle(&batch()).await.unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("telemetry").join("metrics.json")).unwrap();
        assert_eq!(content.lines().count(), 4);
        let first: Metric = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first.name, "a");
    }
}
