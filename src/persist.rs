//! Durable lease records.
//!
//! The daemon writes the full set of active leases after every registry
//! mutation. The write goes to a sibling temp file first and is renamed into
//! place, so a crash mid-write leaves either the old file or the new one. A
//! file that fails to parse is treated as absent: the daemon logs and starts
//! with an empty registry rather than refusing to serve.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// A lease stripped to the fields that survive a daemon restart. The live
/// link handle is deliberately absent; it is re-resolved by name inside the
/// stored namespace on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedLease {
    pub client_id: String,
    /// The last acknowledgement, hex-encoded packet bytes.
    pub ack: String,
    pub link_name: String,
    pub renewal_time: DateTime<Utc>,
    pub rebinding_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
    #[serde(default)]
    pub workload_namespace: Option<String>,
    #[serde(default)]
    pub workload_name: Option<String>,
    pub netns_path: String,
}

pub fn encode_packet_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

pub fn decode_packet_bytes(text: &str) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return Err(Error::PersistenceFailed(
            "malformed packet encoding".to_string(),
        ));
    }
    (0..text.len())
        .step_by(2)
        .map(|index| {
            u8::from_str_radix(&text[index..index + 2], 16).map_err(|error| {
                Error::PersistenceFailed(format!("bad packet encoding: {}", error))
            })
        })
        .collect()
}

/// Replaces the lease file with the given records.
pub async fn save(path: &Path, records: &[PersistedLease]) -> Result<()> {
    let content = serde_json::to_string_pretty(records)
        .map_err(|error| Error::PersistenceFailed(error.to_string()))?;

    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, content)
        .await
        .map_err(|error| Error::PersistenceFailed(format!("{:?}: {}", tmp_path, error)))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|error| Error::PersistenceFailed(format!("{:?}: {}", path, error)))?;

    Ok(())
}

/// Loads the lease file. A missing or unparseable file yields an empty set;
/// a partial write from a crash shows up as a parse failure here.
pub async fn load(path: &Path) -> Vec<PersistedLease> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(error) => {
            warn!("failed to read lease file {:?}: {}", path, error);
            return Vec::new();
        }
    };

    match serde_json::from_str(&content) {
        Ok(records) => records,
        Err(error) => {
            warn!(
                "lease file {:?} is unreadable, starting empty: {}",
                path, error
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::path::PathBuf;

    struct TestGuard(PathBuf);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn test_record(client_id: &str) -> PersistedLease {
        let now = Utc::now();
        PersistedLease {
            client_id: client_id.to_string(),
            ack: encode_packet_bytes(&[0x02, 0x01, 0x06, 0x00, 0xde, 0xad]),
            link_name: "eth0".to_string(),
            renewal_time: now + TimeDelta::seconds(1800),
            rebinding_time: now + TimeDelta::seconds(3150),
            expire_time: now + TimeDelta::seconds(3600),
            workload_namespace: Some("prod".to_string()),
            workload_name: Some("web-0".to_string()),
            netns_path: "/var/run/netns/c1".to_string(),
        }
    }

    #[test]
    fn test_packet_bytes_roundtrip() {
        let bytes = vec![0u8, 1, 2, 0xff, 0xab];
        let encoded = encode_packet_bytes(&bytes);
        assert_eq!(encoded, "000102ffab");
        assert_eq!(decode_packet_bytes(&encoded).unwrap(), bytes);

        assert!(decode_packet_bytes("abc").is_err());
        assert!(decode_packet_bytes("zz").is_err());
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let path = PathBuf::from("test_persist_roundtrip.json");
        let _guard = TestGuard(path.clone());

        let records = vec![test_record("c1/mynet/eth0"), test_record("c2/mynet/eth0")];
        save(&path, &records).await.unwrap();

        let loaded = load(&path).await;
        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn test_save_replaces_previous_contents() {
        let path = PathBuf::from("test_persist_replace.json");
        let _guard = TestGuard(path.clone());

        save(&path, &[test_record("c1/mynet/eth0")]).await.unwrap();
        save(&path, &[]).await.unwrap();

        let loaded = load(&path).await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let loaded = load(Path::new("test_persist_missing.json")).await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_load_corrupt_file() {
        let path = PathBuf::from("test_persist_corrupt.json");
        let _guard = TestGuard(path.clone());

        std::fs::write(&path, "[{\"client_id\": \"c1\", trunc").unwrap();
        let loaded = load(&path).await;
        assert!(loaded.is_empty());
    }
}
