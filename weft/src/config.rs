//! Node configuration, persisted as toml.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// How many concurrent inbound reader subscriptions a state URI keeps open.
const DEFAULT_MAX_PEERS_PER_SUBSCRIPTION: usize = 4;

/// Per-node settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// State URIs this node replicates. Grows when the node submits a tx to
    /// a new URI or receives a private genesis tx it is a member of.
    pub subscribed_state_uris: BTreeSet<String>,
    /// Upper bound on parallel provider subscriptions per state URI.
    pub max_peers_per_subscription: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            subscribed_state_uris: BTreeSet::new(),
            max_peers_per_subscription: DEFAULT_MAX_PEERS_PER_SUBSCRIPTION,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
}

impl Config {
    /// Read the config at `path`, creating it with defaults if absent.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::read_from_file(path)
        } else {
            let config = Config::default();
            config.write_to_file(path)?;
            Ok(config)
        }
    }

    fn read_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config_ser = std::fs::read_to_string(path).context("unable to read config")?;
        let config = toml::from_str(&config_ser).context("unable to decode config")?;
        Ok(config)
    }

    fn write_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("unable to create config dir: {}", parent.display()))?;
        }
        let config_ser = toml::to_string(self).context("unable to serialize configuration")?;
        std::fs::write(path, config_ser).context("unable to write config file")?;
        Ok(())
    }
}

/// A shared view of the config that writes mutations back to disk.
///
/// When constructed without a path (tests, embedded nodes) mutations stay
/// in memory.
#[derive(Debug)]
pub struct SharedConfig {
    path: Option<PathBuf>,
    current: Mutex<Config>,
}

impl SharedConfig {
    /// Load from `path`, creating the file with defaults if absent.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let current = Config::load(&path)?;
        Ok(Self {
            path: Some(path),
            current: Mutex::new(current),
        })
    }

    /// An in-memory config that is never persisted.
    pub fn ephemeral(config: Config) -> Self {
        Self {
            path: None,
            current: Mutex::new(config),
        }
    }

    /// A snapshot of the current settings.
    pub fn get(&self) -> Config {
        self.current.lock().clone()
    }

    /// Whether the node replicates `state_uri`.
    pub fn is_subscribed_to(&self, state_uri: &str) -> bool {
        self.current
            .lock()
            .node
            .subscribed_state_uris
            .contains(state_uri)
    }

    /// Mutate the config and persist the result.
    ///
    /// The mutation is applied under the lock; persistence happens on the
    /// mutated copy, so concurrent updates cannot interleave half-written
    /// files.
    pub fn update(&self, mutate: impl FnOnce(&mut Config)) -> anyhow::Result<()> {
        let mut current = self.current.lock();
        mutate(&mut current);
        if let Some(path) = &self.path {
            current.write_to_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.node.subscribed_state_uris.is_empty());
        assert_eq!(
            config.node.max_peers_per_subscription,
            DEFAULT_MAX_PEERS_PER_SUBSCRIPTION
        );
    }

    #[test]
    fn test_load_creates_and_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node").join("config.toml");

        let created = Config::load(&path).unwrap();
        assert_eq!(created, Config::default());
        assert!(path.exists());

        let reread = Config::load(&path).unwrap();
        assert_eq!(reread, created);
    }

    #[test]
    fn test_shared_config_persists_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let shared = SharedConfig::open(&path).unwrap();
        shared
            .update(|config| {
                config
                    .node
                    .subscribed_state_uris
                    .insert("example.com/doc".into());
            })
            .unwrap();
        assert!(shared.is_subscribed_to("example.com/doc"));

        let reread = Config::load(&path).unwrap();
        assert!(reread
            .node
            .subscribed_state_uris
            .contains("example.com/doc"));
    }

    #[test]
    fn test_ephemeral_config_never_touches_disk() {
        let shared = SharedConfig::ephemeral(Config::default());
        shared
            .update(|config| {
                config.node.max_peers_per_subscription = 9;
            })
            .unwrap();
        assert_eq!(shared.get().node.max_peers_per_subscription, 9);
    }
}
