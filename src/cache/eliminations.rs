use std::fmt;

use serde::{Deserialize, Serialize};

use super::{KeepPolicy, MembershipDocument, MembershipFilteredCache, NoOverrides};
use crate::error::CacheError;
use crate::logging::{obj, v_num, v_str, Domain, Level, Logger};
use crate::registry::RegistrySnapshot;
use crate::store::DurableJsonStore;
use crate::types::Identity;

pub const ELIMINATIONS_KEY: &str = "eliminations";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EliminationReason {
    MaxDailyDrawdown,
    MaxTotalDrawdown,
    Other(String),
}

impl EliminationReason {
    pub fn as_str(&self) -> &str {
        match self {
            EliminationReason::MaxDailyDrawdown => "MAX_DAILY_DRAWDOWN",
            EliminationReason::MaxTotalDrawdown => "MAX_TOTAL_DRAWDOWN",
            EliminationReason::Other(s) => s,
        }
    }
}

impl From<String> for EliminationReason {
    fn from(s: String) -> Self {
        match s.as_str() {
            "MAX_DAILY_DRAWDOWN" => EliminationReason::MaxDailyDrawdown,
            "MAX_TOTAL_DRAWDOWN" => EliminationReason::MaxTotalDrawdown,
            _ => EliminationReason::Other(s),
        }
    }
}

impl From<EliminationReason> for String {
    fn from(r: EliminationReason) -> Self {
        r.as_str().to_string()
    }
}

impl fmt::Display for EliminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One removal. Older documents used `hotkey`, `elimination_initiated_time_ms`
/// and `dd`; both spellings load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EliminationRow {
    #[serde(alias = "hotkey")]
    pub identity: Identity,
    #[serde(alias = "elimination_initiated_time_ms")]
    pub initiated_time_ms: u64,
    #[serde(alias = "dd")]
    pub drawdown_value: f64,
    pub reason: EliminationReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EliminationsDocument {
    #[serde(default)]
    pub eliminations: Vec<EliminationRow>,
}

impl MembershipDocument for EliminationsDocument {
    const FILTERED_EVENT: &'static str = "eliminations_filtered";

    fn retain_identities<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Identity) -> bool,
    {
        let before = self.eliminations.len();
        self.eliminations.retain(|row| keep(&row.identity));
        before - self.eliminations.len()
    }

    fn entry_count(&self) -> usize {
        self.eliminations.len()
    }

    fn merge_pending(&mut self, pending: &Self) {
        for row in &pending.eliminations {
            if !self.eliminations.contains(row) {
                self.eliminations.push(row.clone());
            }
        }
    }
}

/// Eliminations survive deregistration; only the clearing calls remove them.
pub type EliminationCache = MembershipFilteredCache<EliminationsDocument, NoOverrides>;

impl MembershipFilteredCache<EliminationsDocument, NoOverrides> {
    pub fn eliminations(store: DurableJsonStore, logger: Logger) -> Self {
        Self::new(store, ELIMINATIONS_KEY, KeepPolicy::Always, NoOverrides, logger)
    }

    pub fn init_default(&mut self) -> Result<&EliminationsDocument, CacheError> {
        self.init(EliminationsDocument::default())
    }

    pub fn rows(&self) -> &[EliminationRow] {
        &self.document().eliminations
    }

    /// Add a row in memory. It reaches disk on the next [`flush`](Self::flush)
    /// or `load_and_filter`, and survives a reload in between.
    pub fn append(&mut self, row: EliminationRow) {
        self.logger().log(
            Level::Info,
            Domain::Cache,
            "elimination_appended",
            obj(&[
                ("identity", v_str(row.identity.as_str())),
                ("reason", v_str(row.reason.as_str())),
                ("drawdown", v_num(row.drawdown_value)),
                ("initiated_ms", v_num(row.initiated_time_ms as f64)),
            ]),
        );
        self.record_local(|d| d.eliminations.push(row.clone()));
    }

    pub fn is_eliminated(&self, identity: &Identity) -> bool {
        self.rows().iter().any(|r| &r.identity == identity)
    }

    /// The first recorded row for `identity`.
    pub fn elimination_for(&self, identity: &Identity) -> Option<&EliminationRow> {
        self.rows().iter().find(|r| &r.identity == identity)
    }

    /// Administrative removal of every row for `identity`; persists immediately.
    pub fn clear_identity(&mut self, identity: &Identity) -> Result<usize, CacheError> {
        let removed = self.document_mut().retain_identities(|id| id != identity);
        self.pending_mut().retain_identities(|id| id != identity);
        self.flush()?;
        self.logger().log(
            Level::Warn,
            Domain::Cache,
            "elimination_cleared",
            obj(&[
                ("identity", v_str(identity.as_str())),
                ("rows", v_num(removed as f64)),
            ]),
        );
        Ok(removed)
    }

    pub fn clear_all(&mut self) -> Result<(), CacheError> {
        *self.document_mut() = EliminationsDocument::default();
        *self.pending_mut() = EliminationsDocument::default();
        self.flush()?;
        self.logger()
            .log(Level::Warn, Domain::Cache, "eliminations_cleared", obj(&[]));
        Ok(())
    }

    /// Neither registered nor eliminated: the identity left the roster
    /// without being removed for a breach.
    pub fn is_zombie(&self, identity: &Identity, snapshot: &RegistrySnapshot) -> bool {
        !snapshot.contains(identity) && !self.is_eliminated(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::member;

    fn row(id: &str, reason: EliminationReason) -> EliminationRow {
        EliminationRow {
            identity: Identity::new(id),
            initiated_time_ms: 1_700_000_000_000,
            drawdown_value: 0.89,
            reason,
        }
    }

    fn cache(dir: &std::path::Path) -> EliminationCache {
        let store = DurableJsonStore::open(dir, Logger::discard()).unwrap();
        EliminationCache::eliminations(store, Logger::discard())
    }

    #[test]
    fn test_reason_wire_form() {
        let json = serde_json::to_string(&row("a", EliminationReason::MaxTotalDrawdown)).unwrap();
        assert!(json.contains("\"reason\":\"MAX_TOTAL_DRAWDOWN\""));
        let r: EliminationReason = serde_json::from_str("\"PLAGIARISM\"").unwrap();
        assert_eq!(r, EliminationReason::Other("PLAGIARISM".into()));
    }

    #[test]
    fn test_legacy_field_names_load() {
        let doc: EliminationsDocument = serde_json::from_str(
            r#"{"eliminations":[{"hotkey":"h1","elimination_initiated_time_ms":5,"dd":0.8,"reason":"MAX_DAILY_DRAWDOWN"}]}"#,
        )
        .unwrap();
        assert_eq!(doc.eliminations[0].identity, Identity::new("h1"));
        assert_eq!(doc.eliminations[0].reason, EliminationReason::MaxDailyDrawdown);
    }

    #[test]
    fn test_append_is_not_persisted_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cache(dir.path());
        c.init_default().unwrap();
        c.append(row("a", EliminationReason::MaxDailyDrawdown));
        assert!(c.is_eliminated(&"a".into()));

        let mut other = cache(dir.path());
        other.init_default().unwrap();
        assert!(other.rows().is_empty());

        c.flush().unwrap();
        other.load_and_filter(&RegistrySnapshot::default()).unwrap();
        assert_eq!(other.rows().len(), 1);
    }

    #[test]
    fn test_unflushed_append_survives_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cache(dir.path());
        c.init_default().unwrap();
        c.append(row("bob", EliminationReason::MaxTotalDrawdown));

        let snap = RegistrySnapshot::new(vec![member("bob", 0.1, None)]);
        c.load_and_filter(&snap).unwrap();
        assert!(c.is_eliminated(&"bob".into()));
        assert_eq!(c.rows().len(), 1);

        // the refresh wrote it through; a second refresh does not duplicate it
        let on_disk: EliminationsDocument =
            DurableJsonStore::read_path(&dir.path().join("eliminations.json")).unwrap();
        assert_eq!(on_disk.eliminations.len(), 1);
        c.load_and_filter(&snap).unwrap();
        assert_eq!(c.rows().len(), 1);
    }

    #[test]
    fn test_eliminations_outlive_registration() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cache(dir.path());
        c.init_default().unwrap();
        c.append(row("gone", EliminationReason::MaxTotalDrawdown));
        c.flush().unwrap();

        let snap = RegistrySnapshot::new(vec![member("other", 0.1, None)]);
        c.load_and_filter(&snap).unwrap();
        assert!(c.is_eliminated(&"gone".into()));
        assert!(!c.is_zombie(&"gone".into(), &snap));
        assert!(c.is_zombie(&"stranger".into(), &snap));
        assert!(!c.is_zombie(&"other".into(), &snap));
    }

    #[test]
    fn test_clearing() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cache(dir.path());
        c.init_default().unwrap();
        c.append(row("a", EliminationReason::MaxDailyDrawdown));
        c.append(row("a", EliminationReason::MaxTotalDrawdown));
        c.append(row("b", EliminationReason::MaxTotalDrawdown));
        assert_eq!(
            c.elimination_for(&"a".into()).unwrap().reason,
            EliminationReason::MaxDailyDrawdown
        );

        assert_eq!(c.clear_identity(&"a".into()).unwrap(), 2);
        assert!(c.elimination_for(&"a".into()).is_none());
        let on_disk: EliminationsDocument = DurableJsonStore::read_path(
            &dir.path().join("eliminations.json"),
        )
        .unwrap();
        assert_eq!(on_disk.eliminations.len(), 1);

        c.clear_all().unwrap();
        assert!(c.rows().is_empty());
    }
}
