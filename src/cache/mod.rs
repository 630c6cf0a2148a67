//! Disk-backed documents kept in step with the registry roster.
//!
//! [`MembershipFilteredCache`] loads one document through the
//! [`DurableJsonStore`], drops entries according to a [`KeepPolicy`], applies an
//! [`OverrideSource`], and writes the result back. Eliminations and quality
//! scores are the two instantiations.

use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;
use crate::logging::{obj, v_str, Domain, Level, Logger};
use crate::registry::RegistrySnapshot;
use crate::store::DurableJsonStore;
use crate::types::Identity;

pub mod eliminations;
pub mod quality;

pub use eliminations::{EliminationCache, EliminationReason, EliminationRow, EliminationsDocument};
pub use quality::{BlockList, QualityScoreCache, QualityScores};

/// A document whose entries are keyed by participant identity.
pub trait MembershipDocument: Serialize + DeserializeOwned + Clone + Default {
    /// Event logged after each filtered load.
    const FILTERED_EVENT: &'static str;

    /// Keep only entries whose identity passes `keep`; returns how many were dropped.
    fn retain_identities<F>(&mut self, keep: F) -> usize
    where
        F: FnMut(&Identity) -> bool;

    fn entry_count(&self) -> usize;

    /// Fold in entries recorded in memory but not yet flushed.
    fn merge_pending(&mut self, pending: &Self);
}

/// Which entries survive a registry join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepPolicy {
    /// Entries persist whether or not the identity is still registered.
    Always,
    /// Entries for identities absent from the roster are dropped.
    RegisteredOnly,
}

impl KeepPolicy {
    pub fn keeps(&self, identity: &Identity, snapshot: &RegistrySnapshot) -> bool {
        match self {
            KeepPolicy::Always => true,
            KeepPolicy::RegisteredOnly => snapshot.contains(identity),
        }
    }
}

/// Externally maintained entries that take precedence over stored ones.
/// Applied on every load.
pub trait OverrideSource<D> {
    /// Returns how many entries were forced.
    fn apply(&self, document: &mut D) -> Result<usize, CacheError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOverrides;

impl<D> OverrideSource<D> for NoOverrides {
    fn apply(&self, _document: &mut D) -> Result<usize, CacheError> {
        Ok(0)
    }
}

pub struct MembershipFilteredCache<D, O> {
    store: DurableJsonStore,
    key: String,
    keep: KeepPolicy,
    overrides: O,
    doc: D,
    /// Local changes since the last successful write.
    pending: D,
    logger: Logger,
    last_update: Option<Instant>,
}

impl<D, O> MembershipFilteredCache<D, O>
where
    D: MembershipDocument,
    O: OverrideSource<D>,
{
    pub fn new(
        store: DurableJsonStore,
        key: impl Into<String>,
        keep: KeepPolicy,
        overrides: O,
        logger: Logger,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            keep,
            overrides,
            doc: D::default(),
            pending: D::default(),
            logger,
            last_update: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Make sure the document exists on disk (writing `default` if not) and
    /// load it into memory unfiltered.
    pub fn init(&mut self, default: D) -> Result<&D, CacheError> {
        self.doc = self.store.ensure_initialized(&self.key, default)?;
        Ok(&self.doc)
    }

    /// Load from disk, fold in unflushed local changes, join against
    /// `snapshot`, apply overrides, write back. On any error the in-memory
    /// document and pending changes are left as they were.
    pub fn load_and_filter(&mut self, snapshot: &RegistrySnapshot) -> Result<&D, CacheError> {
        let mut doc: D = self.store.ensure_initialized(&self.key, D::default())?;
        let loaded = doc.entry_count();
        doc.merge_pending(&self.pending);
        let keep = self.keep;
        let dropped = doc.retain_identities(|id| keep.keeps(id, snapshot));
        let forced = self.overrides.apply(&mut doc)?;

        self.store.write(&self.key, &doc)?;
        self.logger.log(
            if dropped > 0 { Level::Info } else { Level::Debug },
            Domain::Cache,
            D::FILTERED_EVENT,
            obj(&[
                ("key", v_str(&self.key)),
                ("loaded", serde_json::json!(loaded)),
                ("pending", serde_json::json!(self.pending.entry_count())),
                ("dropped_unregistered", serde_json::json!(dropped)),
                ("overridden", serde_json::json!(forced)),
                ("kept", serde_json::json!(doc.entry_count())),
            ]),
        );
        self.doc = doc;
        self.pending = D::default();
        self.last_update = Some(Instant::now());
        Ok(&self.doc)
    }

    /// Persist the whole in-memory document, replacing what is on disk.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        self.store.write(&self.key, &self.doc)?;
        self.pending = D::default();
        self.last_update = Some(Instant::now());
        Ok(())
    }

    pub fn document(&self) -> &D {
        &self.doc
    }

    pub fn refresh_allowed(&self, interval: Duration) -> bool {
        self.last_update.map(|t| t.elapsed() >= interval).unwrap_or(true)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.entry_count() > 0
    }

    pub(crate) fn document_mut(&mut self) -> &mut D {
        &mut self.doc
    }

    pub(crate) fn pending_mut(&mut self) -> &mut D {
        &mut self.pending
    }

    /// Apply `change` to both the live document and the pending set, so it
    /// survives a reload that happens before the next flush.
    pub(crate) fn record_local<F>(&mut self, mut change: F)
    where
        F: FnMut(&mut D),
    {
        change(&mut self.doc);
        change(&mut self.pending);
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::member;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    #[serde(transparent)]
    struct Tags(BTreeMap<Identity, String>);

    impl MembershipDocument for Tags {
        const FILTERED_EVENT: &'static str = "tags_filtered";

        fn retain_identities<F>(&mut self, mut keep: F) -> usize
        where
            F: FnMut(&Identity) -> bool,
        {
            let before = self.0.len();
            self.0.retain(|k, _| keep(k));
            before - self.0.len()
        }

        fn entry_count(&self) -> usize {
            self.0.len()
        }

        fn merge_pending(&mut self, pending: &Self) {
            self.0.extend(pending.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    struct ForceTag(&'static str);

    impl OverrideSource<Tags> for ForceTag {
        fn apply(&self, document: &mut Tags) -> Result<usize, CacheError> {
            document.0.insert(Identity::new(self.0), "forced".to_string());
            Ok(1)
        }
    }

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        Tags(pairs.iter().map(|(k, v)| (Identity::new(*k), v.to_string())).collect())
    }

    #[test]
    fn test_registered_only_drops_and_overrides_reapply() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableJsonStore::open(dir.path(), Logger::discard()).unwrap();
        store.write("tags", &tags(&[("a", "x"), ("b", "y")])).unwrap();

        let mut cache = MembershipFilteredCache::new(
            store.clone(),
            "tags",
            KeepPolicy::RegisteredOnly,
            ForceTag("z"),
            Logger::discard(),
        );
        let snap = RegistrySnapshot::new(vec![member("a", 0.1, None)]);
        let doc = cache.load_and_filter(&snap).unwrap().clone();
        assert_eq!(doc, tags(&[("a", "x"), ("z", "forced")]));

        // overwrite the forced entry on disk; the next load forces it again
        store.write("tags", &tags(&[("a", "x"), ("z", "edited")])).unwrap();
        let doc = cache.load_and_filter(&snap).unwrap().clone();
        assert_eq!(doc.0.get(&Identity::new("z")).unwrap(), "forced");

        let on_disk: Tags = store.read("tags").unwrap();
        assert_eq!(on_disk, doc);
    }

    #[test]
    fn test_failed_load_keeps_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableJsonStore::open(dir.path(), Logger::discard()).unwrap();
        let mut cache: MembershipFilteredCache<Tags, NoOverrides> = MembershipFilteredCache::new(
            store.clone(),
            "tags",
            KeepPolicy::Always,
            NoOverrides,
            Logger::discard(),
        );
        cache.init(tags(&[("a", "x")])).unwrap();
        std::fs::write(store.path_for("tags"), "not json").unwrap();

        let snap = RegistrySnapshot::default();
        assert!(cache.load_and_filter(&snap).is_err());
        assert_eq!(cache.document(), &tags(&[("a", "x")]));
    }

    #[test]
    fn test_local_change_survives_reload_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableJsonStore::open(dir.path(), Logger::discard()).unwrap();
        let mut cache: MembershipFilteredCache<Tags, NoOverrides> = MembershipFilteredCache::new(
            store.clone(),
            "tags",
            KeepPolicy::Always,
            NoOverrides,
            Logger::discard(),
        );
        cache.init(tags(&[("a", "x")])).unwrap();
        cache.record_local(|d| {
            d.0.insert(Identity::new("b"), "local".to_string());
        });
        assert!(cache.has_pending());

        // someone else edits the document in the meantime
        store.write("tags", &tags(&[("a", "x"), ("c", "remote")])).unwrap();
        let doc = cache.load_and_filter(&RegistrySnapshot::default()).unwrap().clone();
        assert_eq!(doc, tags(&[("a", "x"), ("b", "local"), ("c", "remote")]));
        assert!(!cache.has_pending());

        let on_disk: Tags = store.read("tags").unwrap();
        assert_eq!(on_disk, doc);
    }

    #[test]
    fn test_refresh_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableJsonStore::open(dir.path(), Logger::discard()).unwrap();
        let mut cache: MembershipFilteredCache<Tags, NoOverrides> = MembershipFilteredCache::new(
            store,
            "tags",
            KeepPolicy::Always,
            NoOverrides,
            Logger::discard(),
        );
        assert!(cache.refresh_allowed(Duration::from_secs(300)));
        cache.load_and_filter(&RegistrySnapshot::default()).unwrap();
        assert!(!cache.refresh_allowed(Duration::from_secs(300)));
        assert!(cache.refresh_allowed(Duration::ZERO));
    }
}
