//! Disk round-trips for the membership-filtered caches, the store they sit on,
//! and the drawdown checker that feeds them.

use std::fs;
use std::path::Path;

use chrono::{TimeZone, Utc};

use tradenode::cache::{
    BlockList, EliminationCache, EliminationReason, EliminationsDocument, QualityScoreCache,
    QualityScores,
};
use tradenode::error::{CacheError, CorruptKind, StoreError};
use tradenode::logging::Logger;
use tradenode::registry::{FileRegistry, Member, RegistrySnapshot, RegistrySource};
use tradenode::risk::{calculate_drawdown, BreachKind, DrawdownConfig, MddChecker};
use tradenode::store::DurableJsonStore;
use tradenode::types::Identity;

fn snapshot(ids: &[&str]) -> RegistrySnapshot {
    RegistrySnapshot::new(
        ids.iter()
            .map(|id| Member {
                identity: Identity::new(*id),
                trust: 0.2,
                address: None,
            })
            .collect(),
    )
}

fn open(dir: &Path) -> (DurableJsonStore, EliminationCache, QualityScoreCache) {
    let store = DurableJsonStore::open(dir.join("validation"), Logger::discard()).unwrap();
    let elims = EliminationCache::eliminations(store.clone(), Logger::discard());
    let scores = QualityScoreCache::quality_scores(
        store.clone(),
        BlockList::at(dir.join("blocklist.json")),
        Logger::discard(),
    );
    (store, elims, scores)
}

#[test]
fn departed_identity_keeps_elimination_but_loses_score() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, mut elims, mut scores) = open(dir.path());
    let before = snapshot(&["alice", "bob"]);

    elims.init_default().unwrap();
    scores.init_for(&before).unwrap();
    elims.load_and_filter(&before).unwrap();
    scores.load_and_filter(&before).unwrap();

    let checker = MddChecker::new(DrawdownConfig::default(), Logger::discard());
    let noon = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();
    let ratio = calculate_drawdown(85.0, 100.0).unwrap();
    let kind = checker.check(&mut elims, &"bob".into(), ratio, &noon).unwrap();
    assert_eq!(kind, Some(BreachKind::MaxTotalDrawdown));
    scores.set_score("bob".into(), 0.6).unwrap();
    elims.flush().unwrap();
    scores.flush().unwrap();

    // bob deregisters; a fresh process reloads against the new roster
    let after = snapshot(&["alice"]);
    let (_store, mut elims2, mut scores2) = open(dir.path());
    elims2.load_and_filter(&after).unwrap();
    scores2.load_and_filter(&after).unwrap();

    let bob = Identity::new("bob");
    assert!(elims2.is_eliminated(&bob));
    assert_eq!(
        elims2.elimination_for(&bob).unwrap().reason,
        EliminationReason::MaxTotalDrawdown
    );
    assert!(!elims2.is_zombie(&bob, &after));
    assert_eq!(scores2.document().get(&bob), None);
    assert_eq!(scores2.score(&"alice".into()), 0.0);

    // and the filtered state was written back
    let on_disk: QualityScores = DurableJsonStore::read_path(
        &dir.path().join("validation").join("plagiarism_scores.json"),
    )
    .unwrap();
    assert_eq!(on_disk.len(), 1);
}

#[test]
fn breach_recorded_between_refreshes_is_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, mut elims, _scores) = open(dir.path());
    let roster = snapshot(&["alice", "bob"]);
    elims.init_default().unwrap();
    elims.load_and_filter(&roster).unwrap();

    let checker = MddChecker::new(DrawdownConfig::default(), Logger::discard());
    let noon = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();
    let kind = checker.check(&mut elims, &"bob".into(), 0.5, &noon).unwrap();
    assert_eq!(kind, Some(BreachKind::MaxTotalDrawdown));
    assert!(elims.has_pending());

    // the periodic refresh runs before anyone flushes
    elims.load_and_filter(&roster).unwrap();
    assert!(elims.is_eliminated(&"bob".into()));
    assert!(!elims.has_pending());

    // and it reached disk: a fresh process sees it without any flush
    let (_store, mut reopened, _scores) = open(dir.path());
    reopened.load_and_filter(&snapshot(&["alice"])).unwrap();
    assert!(reopened.is_eliminated(&"bob".into()));
    assert_eq!(reopened.rows().len(), 1);

    // a repeated breach for the same identity adds nothing
    checker.check(&mut elims, &"bob".into(), 0.4, &noon).unwrap();
    elims.load_and_filter(&roster).unwrap();
    assert_eq!(elims.rows().len(), 1);
}

#[test]
fn block_list_edits_apply_on_next_load() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, _elims, mut scores) = open(dir.path());
    let roster = snapshot(&["alice", "bob"]);
    scores.init_for(&roster).unwrap();

    scores.load_and_filter(&roster).unwrap();
    assert_eq!(scores.score(&"bob".into()), 0.0);

    fs::write(dir.path().join("blocklist.json"), r#"[{"miner_id":"bob"}]"#).unwrap();
    scores.load_and_filter(&roster).unwrap();
    assert_eq!(scores.score(&"bob".into()), 1.0);
}

#[test]
fn corrupt_document_is_reported_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let (store, mut elims, _scores) = open(dir.path());
    let path = store.path_for("eliminations");
    fs::write(&path, "{\"eliminations\": [").unwrap();

    let err = elims.load_and_filter(&snapshot(&[])).unwrap_err();
    match err {
        CacheError::Store(StoreError::Corrupt { path: p, kind, .. }) => {
            assert_eq!(p, path);
            assert_eq!(kind, CorruptKind::Syntax);
        }
        other => panic!("expected corrupt document, got {:?}", other),
    }
    assert_eq!(fs::read_to_string(&path).unwrap(), "{\"eliminations\": [");

    // other keys are unaffected
    let fresh: EliminationsDocument = store
        .ensure_initialized("eliminations_backup", EliminationsDocument::default())
        .unwrap();
    assert!(fresh.eliminations.is_empty());
    assert!(store.exists("eliminations_backup"));
}

#[test]
fn wrong_shape_is_classified() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _elims, _scores) = open(dir.path());
    fs::write(store.path_for("plagiarism_scores"), r#"{"alice": "high"}"#).unwrap();
    let err = store.read::<QualityScores>("plagiarism_scores").unwrap_err();
    assert!(matches!(err, StoreError::Corrupt { kind: CorruptKind::Shape, .. }));
}

#[test]
fn file_registry_keeps_last_good_roster() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");
    fs::write(
        &path,
        r#"{"members":[{"identity":"a","trust":0.4,"address":{"host":"10.1.1.1","port":8091}},{"identity":"b"}]}"#,
    )
    .unwrap();

    let registry = FileRegistry::new(&path, Logger::discard());
    assert!(registry.snapshot().is_empty());
    assert_eq!(registry.reload().unwrap(), 2);
    assert_eq!(registry.snapshot().trust(&"a".into()), 0.4);
    assert!(registry.snapshot().address(&"b".into()).is_none());

    fs::write(&path, "garbage").unwrap();
    assert!(registry.reload().is_err());
    assert_eq!(registry.snapshot().len(), 2);
}
