//! Weighted reciprocal rank fusion.
//!
//! Merges independently produced candidate rankings into one ranking using
//! only rank positions, so channels whose native scores live on
//! incompatible scales (cosine distance, BM25, exact lookups) can be
//! combined.
//!
//! # Scoring
//!
//! For every enabled channel `c` with weight `w` and rank constant `k`, the
//! item at 0-based position `r` receives
//!
//! ```text
//! w × 1 / (k + r + 1)
//! ```
//!
//! Contributions are summed per item. Items a channel did not return get
//! nothing from it. A larger `k` flattens the difference between the top
//! and the tail of a channel, which is how low-trust channels are kept from
//! dominating.
//!
//! # Ordering
//!
//! Channels are visited in ascending name order whatever the iteration order
//! of the input maps, so the output (scores and tie order) depends only on
//! channel contents and configs. The result is sorted by descending score;
//! exact ties keep first-appearance order.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use meme_search_core::fusion::{fuse, ChannelConfig};
//!
//! let results = HashMap::from([
//!     ("caption".to_string(), vec!["meme_2".to_string(), "meme_9".to_string()]),
//!     ("face".to_string(), vec!["meme_7".to_string(), "meme_2".to_string()]),
//! ]);
//! let configs = HashMap::from([
//!     ("caption".to_string(), ChannelConfig::new("caption", 0.3, 30.0).unwrap()),
//!     ("face".to_string(), ChannelConfig::new("face", 0.2, 30.0).unwrap()),
//! ]);
//!
//! let fused = fuse(&results, &configs);
//! assert_eq!(fused[0].id, "meme_2");
//! ```

use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::debug;

use crate::models::{ChannelResult, ItemId};

/// Static fusion policy for one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelConfig {
    pub name: String,
    /// Multiplier applied to every contribution of this channel (`> 0`).
    pub weight: f64,
    /// Rank-damping constant `k` (`> 0`).
    pub rank_constant: f64,
    /// Recomputed per query; a disabled channel is never iterated.
    pub enabled: bool,
}

impl ChannelConfig {
    /// Build an enabled channel config.
    ///
    /// # Errors
    ///
    /// Fails unless both `weight` and `rank_constant` are finite and `> 0`.
    pub fn new(name: impl Into<String>, weight: f64, rank_constant: f64) -> Result<Self> {
        let name = name.into();
        if !(weight.is_finite() && weight > 0.0) {
            bail!("channel '{}': weight must be > 0, got {}", name, weight);
        }
        if !(rank_constant.is_finite() && rank_constant > 0.0) {
            bail!(
                "channel '{}': rank constant must be > 0, got {}",
                name,
                rank_constant
            );
        }
        Ok(Self {
            name,
            weight,
            rank_constant,
            enabled: true,
        })
    }

    /// Same policy with the `enabled` flag replaced.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Contribution of the item at 0-based position `rank`.
    pub fn contribution(&self, rank: usize) -> f64 {
        self.weight * (1.0 / (self.rank_constant + rank as f64 + 1.0))
    }
}

/// One entry of a fused ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedItem {
    pub id: ItemId,
    pub score: f64,
}

/// Default-zero score accumulator that remembers first-appearance order.
#[derive(Debug, Default)]
struct ScoreMap {
    positions: HashMap<ItemId, usize>,
    entries: Vec<FusedItem>,
}

impl ScoreMap {
    fn add(&mut self, id: &str, contribution: f64) {
        let entries = &mut self.entries;
        let pos = *self.positions.entry(id.to_string()).or_insert_with(|| {
            entries.push(FusedItem {
                id: id.to_string(),
                score: 0.0,
            });
            entries.len() - 1
        });
        self.entries[pos].score += contribution;
    }

    fn into_ranked(self) -> Vec<FusedItem> {
        let mut ranked: Vec<FusedItem> = self
            .entries
            .into_iter()
            .filter(|item| item.score != 0.0)
            .collect();
        // `sort_by` is stable: equal scores keep first-appearance order.
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }
}

/// Fuse channel results into one ranking.
///
/// `results` maps channel name to its ordered candidates and `configs` maps
/// channel name to its policy. Disabled channels and channels without a
/// config are skipped. Returns every item with a non-zero score, best first.
/// Never fails; empty input yields an empty ranking.
pub fn fuse(
    results: &HashMap<String, ChannelResult>,
    configs: &HashMap<String, ChannelConfig>,
) -> Vec<FusedItem> {
    let mut names: Vec<&String> = results.keys().collect();
    names.sort();

    let mut scores = ScoreMap::default();
    for name in names {
        let config = match configs.get(name) {
            Some(c) => c,
            None => {
                debug!(channel = %name, "no fusion config for channel; skipping");
                continue;
            }
        };
        if !config.enabled {
            continue;
        }
        for (rank, id) in results[name].iter().enumerate() {
            scores.add(id, config.contribution(rank));
        }
    }

    scores.into_ranked()
}

/// Fuse and keep only the ids of the best `top_k` items.
pub fn fuse_top_k(
    results: &HashMap<String, ChannelResult>,
    configs: &HashMap<String, ChannelConfig>,
    top_k: usize,
) -> Vec<ItemId> {
    let mut fused = fuse(results, configs);
    fused.truncate(top_k);
    fused.into_iter().map(|item| item.id).collect()
}
