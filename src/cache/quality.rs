use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{KeepPolicy, MembershipDocument, MembershipFilteredCache, OverrideSource};
use crate::error::{ensure_finite, CacheError, ValidationError};
use crate::logging::{obj, v_num, v_str, Domain, Level, Logger};
use crate::registry::RegistrySnapshot;
use crate::store::DurableJsonStore;
use crate::types::Identity;

pub const QUALITY_SCORES_KEY: &str = "plagiarism_scores";

/// Score forced onto every block-listed identity.
pub const MAX_PENALTY: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityScores(pub BTreeMap<Identity, f64>);

impl QualityScores {
    pub fn get(&self, identity: &Identity) -> Option<f64> {
        self.0.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl MembershipDocument for QualityScores {
    const FILTERED_EVENT: &'static str = "scores_filtered";

    fn retain_identities<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Identity) -> bool,
    {
        let before = self.0.len();
        self.0.retain(|id, _| keep(id));
        before - self.0.len()
    }

    fn entry_count(&self) -> usize {
        self.0.len()
    }

    fn merge_pending(&mut self, pending: &Self) {
        self.0.extend(pending.0.iter().map(|(id, score)| (id.clone(), *score)));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockListEntry {
    #[serde(alias = "miner_id")]
    pub identity: Identity,
}

/// Externally maintained list of identities that always get [`MAX_PENALTY`].
/// Re-read on every apply; a missing file means nobody is blocked.
#[derive(Debug, Clone)]
pub struct BlockList {
    path: PathBuf,
}

impl BlockList {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<Vec<Identity>, CacheError> {
        match DurableJsonStore::read_path::<Vec<BlockListEntry>>(&self.path) {
            Ok(entries) => Ok(entries.into_iter().map(|e| e.identity).collect()),
            Err(e) if e.is_missing() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl OverrideSource<QualityScores> for BlockList {
    fn apply(&self, document: &mut QualityScores) -> Result<usize, CacheError> {
        let blocked = self.load()?;
        for id in &blocked {
            document.0.insert(id.clone(), MAX_PENALTY);
        }
        Ok(blocked.len())
    }
}

/// Scores are dropped for identities that leave the roster.
pub type QualityScoreCache = MembershipFilteredCache<QualityScores, BlockList>;

impl MembershipFilteredCache<QualityScores, BlockList> {
    pub fn quality_scores(store: DurableJsonStore, block_list: BlockList, logger: Logger) -> Self {
        Self::new(
            store,
            QUALITY_SCORES_KEY,
            KeepPolicy::RegisteredOnly,
            block_list,
            logger,
        )
    }

    /// Create the document if needed; an empty document is seeded with a zero
    /// score for every current member.
    pub fn init_for(&mut self, snapshot: &RegistrySnapshot) -> Result<&QualityScores, CacheError> {
        let seeded = QualityScores(snapshot.members().map(|id| (id.clone(), 0.0)).collect());
        let loaded = self.init(seeded.clone())?.clone();
        if loaded.is_empty() && !seeded.is_empty() {
            *self.document_mut() = seeded;
            self.flush()?;
        }
        Ok(self.document())
    }

    /// Stored score, 0 when the identity has none.
    pub fn score(&self, identity: &Identity) -> f64 {
        self.document().get(identity).unwrap_or(0.0)
    }

    /// Update one score in memory; it is persisted by `flush` or the next
    /// `load_and_filter`.
    pub fn set_score(&mut self, identity: Identity, score: f64) -> Result<(), CacheError> {
        let score = ensure_finite("score", score)?;
        if !(0.0..=MAX_PENALTY).contains(&score) {
            return Err(ValidationError::OutOfRange {
                field: "score",
                value: score,
                min: 0.0,
                max: MAX_PENALTY,
            }
            .into());
        }
        self.logger().log(
            Level::Debug,
            Domain::Cache,
            "score_set",
            obj(&[("identity", v_str(identity.as_str())), ("score", v_num(score))]),
        );
        self.record_local(|d| {
            d.0.insert(identity.clone(), score);
        });
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<(), CacheError> {
        *self.document_mut() = QualityScores::default();
        *self.pending_mut() = QualityScores::default();
        self.flush()?;
        self.logger()
            .log(Level::Warn, Domain::Cache, "scores_cleared", obj(&[]));
        Ok(())
    }
}
