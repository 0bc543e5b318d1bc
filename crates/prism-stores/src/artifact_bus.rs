//! Filesystem artifact bus
//!
//! Crash-safe, append-only storage of large task outputs. Each agent owns a
//! private directory with a manifest allocating strictly monotonic sequence
//! numbers; published artifacts are immutable.
//!
//! Layout: `<workspace>/agents/<agent_id>/out/<seq>.json`, manifest at
//! `<workspace>/agents/<agent_id>/meta.json`, run logs under `logs/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Artifact bus errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("artifact not found: {0}")]
    NotFound(String),
}

/// Metadata attached to every published artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub query: String,
    /// ISO-8601 UTC, second precision
    #[serde(with = "rfc3339_seconds")]
    pub timestamp: DateTime<Utc>,
    pub row_count: usize,
    pub agent: String,
    pub version: String,
}

/// Canonical artifact payload: `{data, metadata}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub data: Vec<Value>,
    pub metadata: ArtifactMetadata,
}

impl ArtifactPayload {
    /// Build a payload stamping `row_count` and `timestamp` from the data.
    pub fn new(
        data: Vec<Value>,
        query: impl Into<String>,
        agent: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let row_count = data.len();
        Self {
            data,
            metadata: ArtifactMetadata {
                query: query.into(),
                timestamp: Utc::now(),
                row_count,
                agent: agent.into(),
                version: version.into(),
            },
        }
    }
}

/// Per-agent manifest allocating sequence numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub next_sequence: u64,
    pub total_published: u64,
    #[serde(with = "rfc3339_seconds")]
    pub last_updated_at: DateTime<Utc>,
}

impl Manifest {
    fn initial() -> Self {
        Self {
            next_sequence: 1,
            total_published: 0,
            last_updated_at: Utc::now(),
        }
    }
}

/// Content-addressed, append-only artifact store rooted at
/// `<workspace>/agents/`.
pub struct ArtifactBus {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactBus {
    /// Create a bus rooted at the workspace directory.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            root: workspace.into().join("agents"),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Directory owned by an agent.
    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join(agent_id)
    }

    /// Publish a payload for an agent. Validates the payload, allocates the
    /// next sequence number under the agent's lock, writes atomically, and
    /// commits the manifest. Returns the immutable artifact path.
    pub async fn publish(&self, agent_id: &str, payload: &ArtifactPayload) -> Result<PathBuf, BusError> {
        validate_payload(agent_id, payload)?;

        let lock = self.lock_for(agent_id).await;
        let _guard = lock.lock().await;

        let agent_dir = self.agent_dir(agent_id);
        let out_dir = agent_dir.join("out");
        tokio::fs::create_dir_all(&out_dir).await?;

        let manifest_path = agent_dir.join("meta.json");
        let mut manifest = self.read_manifest(&manifest_path).await?;

        let sequence = manifest.next_sequence;
        let artifact_path = out_dir.join(format!("{sequence:06}.json"));
        write_atomic(&artifact_path, &serde_json::to_vec_pretty(payload)?).await?;

        manifest.next_sequence += 1;
        manifest.total_published += 1;
        manifest.last_updated_at = Utc::now();
        write_atomic(&manifest_path, &serde_json::to_vec_pretty(&manifest)?).await?;

        tracing::debug!(
            agent = agent_id,
            sequence,
            rows = payload.metadata.row_count,
            path = %artifact_path.display(),
            "artifact published"
        );
        Ok(artifact_path)
    }

    /// Read a published artifact back.
    pub async fn read(&self, artifact_ref: &Path) -> Result<ArtifactPayload, BusError> {
        let bytes = tokio::fs::read(artifact_ref)
            .await
            .map_err(|_| BusError::NotFound(artifact_ref.display().to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write a run log for an agent at `logs/<run_id>.json`.
    pub async fn write_log(
        &self,
        agent_id: &str,
        run_id: &str,
        value: &Value,
    ) -> Result<PathBuf, BusError> {
        let logs_dir = self.agent_dir(agent_id).join("logs");
        tokio::fs::create_dir_all(&logs_dir).await?;
        let path = logs_dir.join(format!("{run_id}.json"));
        write_atomic(&path, &serde_json::to_vec_pretty(value)?).await?;
        Ok(path)
    }

    /// Write an auxiliary document (e.g. an execution plan) under a named
    /// subdirectory of the agent's workspace.
    pub async fn write_document(
        &self,
        agent_id: &str,
        subdir: &str,
        filename: &str,
        value: &Value,
    ) -> Result<PathBuf, BusError> {
        let dir = self.agent_dir(agent_id).join(subdir);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(filename);
        write_atomic(&path, &serde_json::to_vec_pretty(value)?).await?;
        Ok(path)
    }

    /// Current manifest statistics for an agent.
    pub async fn stats(&self, agent_id: &str) -> Result<Manifest, BusError> {
        self.read_manifest(&self.agent_dir(agent_id).join("meta.json"))
            .await
    }

    async fn read_manifest(&self, path: &Path) -> Result<Manifest, BusError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::initial()),
            Err(e) => Err(BusError::Io(e)),
        }
    }

    async fn lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn validate_payload(agent_id: &str, payload: &ArtifactPayload) -> Result<(), BusError> {
    let meta = &payload.metadata;
    if meta.agent.is_empty() || meta.version.is_empty() {
        return Err(BusError::InvalidPayload(
            "metadata agent and version are required".to_string(),
        ));
    }
    if meta.agent != agent_id {
        return Err(BusError::InvalidPayload(format!(
            "metadata agent '{}' does not match publishing agent '{agent_id}'",
            meta.agent
        )));
    }
    if meta.row_count != payload.data.len() {
        return Err(BusError::InvalidPayload(format!(
            "row_count {} does not match data length {}",
            meta.row_count,
            payload.data.len()
        )));
    }
    Ok(())
}

/// Temp-file + fsync + rename write. The temp sibling lives in the target
/// directory so the rename stays on one filesystem.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BusError> {
    let parent = path
        .parent()
        .ok_or_else(|| BusError::InvalidPayload(format!("no parent dir for {}", path.display())))?;
    let temp_path = parent.join(format!(
        ".{}.tmp",
        uuid::Uuid::new_v4().simple()
    ));

    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(BusError::Io(e));
    }
    Ok(())
}

/// RFC 3339 with second precision, always UTC (`...Z`).
mod rfc3339_seconds {
    use super::*;
    use serde::{de::Error as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_workspace() -> PathBuf {
        std::env::temp_dir().join(format!("prism-bus-{}", uuid::Uuid::new_v4().simple()))
    }

    fn payload(agent: &str, rows: usize) -> ArtifactPayload {
        let data = (0..rows).map(|i| json!({"row": i})).collect();
        ArtifactPayload::new(data, "test query", agent, "1.0")
    }

    #[tokio::test]
    async fn test_publish_allocates_monotonic_sequences() {
        let workspace = temp_workspace();
        let bus = ArtifactBus::new(&workspace);

        let first = bus.publish("market_data", &payload("market_data", 2)).await.expect("first");
        let second = bus.publish("market_data", &payload("market_data", 1)).await.expect("second");

        assert!(first.ends_with("market_data/out/000001.json"));
        assert!(second.ends_with("market_data/out/000002.json"));

        let stats = bus.stats("market_data").await.expect("stats");
        assert_eq!(stats.next_sequence, 3);
        assert_eq!(stats.total_published, 2);

        let _ = tokio::fs::remove_dir_all(&workspace).await;
    }

    #[tokio::test]
    async fn test_sequences_are_independent_per_agent() {
        let workspace = temp_workspace();
        let bus = ArtifactBus::new(&workspace);

        bus.publish("a", &payload("a", 1)).await.expect("a1");
        let b = bus.publish("b", &payload("b", 1)).await.expect("b1");
        assert!(b.ends_with("b/out/000001.json"));

        let _ = tokio::fs::remove_dir_all(&workspace).await;
    }

    #[tokio::test]
    async fn test_row_count_mismatch_is_rejected() {
        let workspace = temp_workspace();
        let bus = ArtifactBus::new(&workspace);

        let mut bad = payload("a", 2);
        bad.metadata.row_count = 5;
        let err = bus.publish("a", &bad).await.expect_err("must reject");
        assert!(matches!(err, BusError::InvalidPayload(_)));

        let _ = tokio::fs::remove_dir_all(&workspace).await;
    }

    #[tokio::test]
    async fn test_agent_mismatch_is_rejected() {
        let workspace = temp_workspace();
        let bus = ArtifactBus::new(&workspace);

        let err = bus
            .publish("a", &payload("someone_else", 1))
            .await
            .expect_err("must reject");
        assert!(matches!(err, BusError::InvalidPayload(_)));

        let _ = tokio::fs::remove_dir_all(&workspace).await;
    }

    #[tokio::test]
    async fn test_published_artifact_reads_back() {
        let workspace = temp_workspace();
        let bus = ArtifactBus::new(&workspace);

        let original = payload("a", 3);
        let artifact_ref = bus.publish("a", &original).await.expect("publish");
        let read = bus.read(&artifact_ref).await.expect("read");

        assert_eq!(read.data, original.data);
        assert_eq!(read.metadata.row_count, 3);
        assert_eq!(read.metadata.agent, "a");

        let _ = tokio::fs::remove_dir_all(&workspace).await;
    }

    #[tokio::test]
    async fn test_timestamp_serializes_at_second_precision() {
        let encoded = serde_json::to_value(&payload("a", 0).metadata).expect("encode");
        let raw = encoded["timestamp"].as_str().expect("string");
        assert!(raw.ends_with('Z'));
        assert!(!raw.contains('.'));
    }

    #[tokio::test]
    async fn test_concurrent_publishes_have_no_gaps() {
        let workspace = temp_workspace();
        let bus = Arc::new(ArtifactBus::new(&workspace));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                bus.publish("a", &payload("a", 1)).await.expect("publish")
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let stats = bus.stats("a").await.expect("stats");
        assert_eq!(stats.total_published, 8);
        assert_eq!(stats.next_sequence, 9);
        for seq in 1..=8u64 {
            let path = bus.agent_dir("a").join("out").join(format!("{seq:06}.json"));
            assert!(path.exists(), "missing artifact {seq}");
        }

        let _ = tokio::fs::remove_dir_all(&workspace).await;
    }
}
