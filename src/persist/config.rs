use crate::error::StoreError;
use crate::persist::{Index, ServerAddress};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Config is a cluster membership configuration. A *normal* config has an
/// empty `new_servers`; an *old-new* (joint) config carries both member sets
/// and requires majorities of each for every decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub servers: Vec<ServerAddress>,
    pub new_servers: Vec<ServerAddress>,
}

impl Config {
    pub fn normal(servers: Vec<ServerAddress>) -> Self {
        Config {
            servers,
            new_servers: Vec::new(),
        }
    }

    pub fn old_new(servers: Vec<ServerAddress>, new_servers: Vec<ServerAddress>) -> Self {
        Config {
            servers,
            new_servers,
        }
    }

    pub fn is_normal(&self) -> bool {
        !self.servers.is_empty() && self.new_servers.is_empty()
    }

    pub fn is_old_new(&self) -> bool {
        !self.servers.is_empty() && !self.new_servers.is_empty()
    }

    /// Every address participating in either half.
    pub fn all_servers(&self) -> Vec<ServerAddress> {
        let mut all = self.servers.clone();
        for s in &self.new_servers {
            if !all.contains(s) {
                all.push(s.clone());
            }
        }
        all
    }

    pub fn contains(&self, addr: &ServerAddress) -> bool {
        self.servers.contains(addr) || self.new_servers.contains(addr)
    }

    pub fn encode(&self) -> Result<Bytes, StoreError> {
        let raw = serde_json::to_vec(self)
            .map_err(|e| StoreError::Corrupted(format!("config encode: {}", e)))?;
        Ok(Bytes::from(raw))
    }

    pub fn decode(data: &[u8]) -> Result<Config, StoreError> {
        serde_json::from_slice(data)
            .map_err(|e| StoreError::Corrupted(format!("config decode: {}", e)))
    }
}

/// A configuration together with the log index of the entry that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMeta {
    pub index: Index,
    pub conf: Config,
}

/// ConfigManager indexes every configuration entry seen in the log, in log
/// order. Configurations take effect when seen (appended), not when
/// committed, so the manager tracks uncommitted entries too and must be
/// truncated in lockstep with the log.
pub trait ConfigManager: Send + Sync {
    fn push_config(&self, index: Index, conf: Config) -> Result<(), StoreError>;

    /// All configs starting from the one in effect at `committed_index`: the
    /// last config at-or-before that index, followed by any configs after it.
    fn list_after(&self, committed_index: Index) -> Result<Vec<ConfigMeta>, StoreError>;

    /// The nth most recent config, 1-based (`rnth(1)` is the latest).
    fn rnth(&self, n: usize) -> Result<Option<Config>, StoreError>;

    fn last_config(&self) -> Result<Config, StoreError>;

    /// Drops configs carried by entries with index greater than `index`.
    fn truncate_after(&self, index: Index) -> Result<(), StoreError>;
}

/// MemoryConfigManager keeps the config history in memory, seeded with the
/// boot configuration at index 0.
pub struct MemoryConfigManager {
    metas: Mutex<Vec<ConfigMeta>>,
}

impl MemoryConfigManager {
    pub fn new(initial: Config) -> Self {
        MemoryConfigManager {
            metas: Mutex::new(vec![ConfigMeta {
                index: Index::new(0),
                conf: initial,
            }]),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ConfigMeta>> {
        self.metas.lock().expect("config manager mutex poisoned")
    }
}

impl ConfigManager for MemoryConfigManager {
    fn push_config(&self, index: Index, conf: Config) -> Result<(), StoreError> {
        let mut metas = self.lock();
        if let Some(last) = metas.last() {
            if index <= last.index {
                return Err(StoreError::Corrupted(format!(
                    "config index {} not after {}",
                    index, last.index
                )));
            }
        }
        metas.push(ConfigMeta { index, conf });
        Ok(())
    }

    fn list_after(&self, committed_index: Index) -> Result<Vec<ConfigMeta>, StoreError> {
        let metas = self.lock();
        let start = metas
            .iter()
            .rposition(|m| m.index <= committed_index)
            .unwrap_or(0);
        Ok(metas[start..].to_vec())
    }

    fn rnth(&self, n: usize) -> Result<Option<Config>, StoreError> {
        if n == 0 {
            return Err(StoreError::Corrupted("rnth is 1-based".to_string()));
        }
        let metas = self.lock();
        Ok(metas
            .len()
            .checked_sub(n)
            .map(|i| metas[i].conf.clone()))
    }

    fn last_config(&self) -> Result<Config, StoreError> {
        let metas = self.lock();
        metas
            .last()
            .map(|m| m.conf.clone())
            .ok_or_else(|| StoreError::Corrupted("config history is empty".to_string()))
    }

    fn truncate_after(&self, index: Index) -> Result<(), StoreError> {
        let mut metas = self.lock();
        metas.retain(|m| m.index <= index);
        if metas.is_empty() {
            return Err(StoreError::Corrupted(format!(
                "config truncate at {} removed the boot config",
                index
            )));
        }
        Ok(())
    }
}
