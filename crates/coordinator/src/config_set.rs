//! Runtime tunables, refreshed from the store and read without locking.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::warn;

use crate::error::{Error, Result};

/// Known runtime tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// Upload speed cap (bytes/s) for delegate transfers.
    DelegateMinSpeed,
    /// Upload speed cap (bytes/s) for second-round expansion.
    SprandMinSpeed,
    /// Hours a propagation may take.
    MaxHour,
    /// Object storage split size in bytes.
    OssSplitSize,
    /// Per-node concurrency cap.
    Concurrency,
    /// Probability (percent) of routing uploads through `AddP2PFile`.
    AddP2pFile,
    /// Whether nodes transfer directly to each other.
    TransNode,
    /// Minimum task priority level for which new tasks are issued.
    GenPieceLevel,
    /// Node upload speed limit in bytes/s.
    P2pUpspeedLimit,
    /// Whether small files are merged into shared pieces.
    MergePiece,
    /// Whether nodes keep a download cache.
    DownloadCache,
}

impl ConfigKey {
    /// Every known key.
    pub const ALL: [Self; 11] = [
        Self::DelegateMinSpeed,
        Self::SprandMinSpeed,
        Self::MaxHour,
        Self::OssSplitSize,
        Self::Concurrency,
        Self::AddP2pFile,
        Self::TransNode,
        Self::GenPieceLevel,
        Self::P2pUpspeedLimit,
        Self::MergePiece,
        Self::DownloadCache,
    ];

    /// Name under which the value is stored.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DelegateMinSpeed => "delegate_min_speed",
            Self::SprandMinSpeed => "sprand_min_speed",
            Self::MaxHour => "max_hour",
            Self::OssSplitSize => "oss_split_size",
            Self::Concurrency => "con",
            Self::AddP2pFile => "add_p2p_file",
            Self::TransNode => "trans_node",
            Self::GenPieceLevel => "gen_piece_level",
            Self::P2pUpspeedLimit => "p2p_upspeed_limit",
            Self::MergePiece => "merge_piece",
            Self::DownloadCache => "download_cache",
        }
    }

    /// Value used until the store provides one.
    #[must_use]
    pub const fn default_value(self) -> i64 {
        match self {
            Self::DelegateMinSpeed => 500 * 1024,
            Self::SprandMinSpeed => 300 * 1024,
            Self::MaxHour => 8,
            Self::OssSplitSize => 5 * 1024 * 1024,
            Self::Concurrency => 20,
            Self::AddP2pFile | Self::GenPieceLevel | Self::MergePiece | Self::DownloadCache => 0,
            Self::TransNode => 1,
            Self::P2pUpspeedLimit => 1_048_576,
        }
    }
}

fn defaults() -> HashMap<String, i64> {
    ConfigKey::ALL
        .into_iter()
        .map(|key| (key.name().to_string(), key.default_value()))
        .collect()
}

/// Shared snapshot of runtime tunables.
///
/// Readers load the current snapshot without locking; a refresh swaps in a
/// whole new map, so a reader sees either the old or the new values.
#[derive(Debug)]
pub struct ConfigSet {
    values: ArcSwap<HashMap<String, i64>>,
}

impl Default for ConfigSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSet {
    /// A set holding the default of every known key.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: ArcSwap::from_pointee(defaults()),
        }
    }

    /// Value of a known key.
    #[must_use]
    pub fn get(&self, key: ConfigKey) -> i64 {
        self.values
            .load()
            .get(key.name())
            .copied()
            .unwrap_or_else(|| key.default_value())
    }

    /// Value of any key, known or not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key was never set.
    pub fn get_named(&self, name: &str) -> Result<i64> {
        self.values
            .load()
            .get(name)
            .copied()
            .ok_or_else(|| Error::not_found(format!("config key {name}")))
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<String, i64>> {
        self.values.load_full()
    }

    /// Overlays raw values from the store onto the current snapshot. Values
    /// that do not parse as integers are skipped. Returns how many were
    /// applied.
    pub fn merge(&self, entries: HashMap<String, String>) -> usize {
        let mut next = HashMap::clone(&self.values.load());
        let mut applied = 0;

        for (name, raw) in entries {
            match raw.trim().parse::<i64>() {
                Ok(value) => {
                    next.insert(name, value);
                    applied += 1;
                }
                Err(e) => warn!("ignoring config value {}={:?}: {}", name, raw, e),
            }
        }

        self.values.store(Arc::new(next));
        applied
    }
}
