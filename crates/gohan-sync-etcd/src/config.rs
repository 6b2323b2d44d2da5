use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use gohan_sync_core::{SyncBackend, SyncError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::kv::MemoryKvStore;
use crate::sync::{EtcdSync, DEFAULT_LOCK_TTL, DEFAULT_TIMEOUT};

/// Kind of sync backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// etcd v3 cluster.
    #[default]
    #[serde(alias = "etcd")]
    Etcdv3,
    /// In-process store; locks only exclude tasks of this process.
    Memory,
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncType::Etcdv3 => write!(f, "etcdv3"),
            SyncType::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for SyncType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "etcdv3" | "etcd" => Ok(SyncType::Etcdv3),
            "memory" => Ok(SyncType::Memory),
            other => Err(SyncError::InvalidArgument(format!("unknown sync type: {}", other))),
        }
    }
}

/// Settings needed to construct a sync backend.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sync_type: SyncType,
    pub endpoints: Vec<String>,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Lease TTL of cluster locks.
    pub lock_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_type: SyncType::Etcdv3,
            endpoints: vec!["localhost:2379".to_string()],
            timeout: DEFAULT_TIMEOUT,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }
}

/// Build the sync backend described by `config`.
pub fn create_from_config(config: &SyncConfig) -> Result<Arc<dyn SyncBackend>, SyncError> {
    if config.lock_ttl < Duration::from_secs(1) {
        return Err(SyncError::InvalidArgument(format!(
            "lock TTL must be at least one second, got {:?}",
            config.lock_ttl
        )));
    }

    let backend: Arc<dyn SyncBackend> = match config.sync_type {
        SyncType::Etcdv3 => {
            info!(
                "Using etcd v3 sync backend: {}",
                config.endpoints.join(",")
            );
            Arc::new(EtcdSync::connect(&config.endpoints, config.timeout, config.lock_ttl)?)
        }
        SyncType::Memory => {
            info!("Using in-memory sync backend");
            Arc::new(EtcdSync::new(
                Arc::new(MemoryKvStore::new()),
                config.timeout,
                config.lock_ttl,
            ))
        }
    };

    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_type_parse() {
        assert_eq!("etcdv3".parse::<SyncType>().unwrap(), SyncType::Etcdv3);
        assert_eq!("etcd".parse::<SyncType>().unwrap(), SyncType::Etcdv3);
        assert_eq!("memory".parse::<SyncType>().unwrap(), SyncType::Memory);
        assert!(matches!(
            "zookeeper".parse::<SyncType>(),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_create_memory_backend() {
        let config = SyncConfig {
            sync_type: SyncType::Memory,
            ..Default::default()
        };
        let backend = create_from_config(&config).unwrap();
        assert_eq!(backend.backend_name(), "memory");
        assert!(!backend.process_id().is_empty());
    }

    #[tokio::test]
    async fn test_create_etcd_requires_endpoints() {
        let config = SyncConfig {
            endpoints: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(
            create_from_config(&config).err(),
            Some(SyncError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_sub_second_lock_ttl() {
        let config = SyncConfig {
            sync_type: SyncType::Memory,
            lock_ttl: Duration::from_millis(10),
            ..Default::default()
        };
        assert!(matches!(
            create_from_config(&config).err(),
            Some(SyncError::InvalidArgument(_))
        ));
    }
}
