use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::sleep;

use tradenode::cache::{BlockList, EliminationCache, QualityScoreCache};
use tradenode::config::NodeConfig;
use tradenode::logging::{obj, v_num, v_str, Domain, Level, Logger};
use tradenode::peer::http::HttpPeerClient;
use tradenode::reconcile::PositionReconciler;
use tradenode::registry::{FileRegistry, RegistrySource};
use tradenode::risk::{EquitySnapshot, MddChecker, EQUITY_KEY};
use tradenode::store::DurableJsonStore;
use tradenode::types::Identity;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = NodeConfig::from_env();
    let logger = Logger::from_config(&cfg.log_config()).context("open run log")?;
    logger.log(
        Level::Info,
        Domain::System,
        "node_start",
        obj(&[
            ("data_dir", v_str(&cfg.data_dir.display().to_string())),
            ("registry", v_str(&cfg.registry_path.display().to_string())),
            ("self", json!(cfg.self_identity.as_ref().map(|i| i.as_str()))),
        ]),
    );

    let registry = Arc::new(FileRegistry::new(&cfg.registry_path, logger.clone()));
    if let Err(e) = registry.reload() {
        logger.log(
            Level::Warn,
            Domain::Registry,
            "registry_unavailable",
            obj(&[("error", v_str(&e.to_string()))]),
        );
    }

    let store = DurableJsonStore::open(&cfg.data_dir, logger.clone())?;
    let mut eliminations = EliminationCache::eliminations(store.clone(), logger.clone());
    let mut scores = QualityScoreCache::quality_scores(
        store.clone(),
        BlockList::at(&cfg.blocklist_path),
        logger.clone(),
    );
    eliminations.init_default()?;
    scores.init_for(&registry.snapshot())?;
    refresh_caches(&registry, &mut eliminations, &mut scores, &logger);
    let checker = MddChecker::new(cfg.drawdown_config(), logger.clone());
    check_drawdowns(&checker, &store, &mut eliminations, &logger);

    let client = HttpPeerClient::new(cfg.reconciler_config().peer_timeout)?;
    let mut reconciler = PositionReconciler::new(
        Arc::new(client),
        registry.clone(),
        cfg.reconciler_config(),
        logger.clone(),
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let poller = tokio::spawn(async move {
        reconciler.run_update_loop(stop_rx).await;
    });

    let interval = cfg.cache_refresh_interval();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep(interval) => {
                if let Err(e) = registry.reload() {
                    logger.log(
                        Level::Warn,
                        Domain::Registry,
                        "registry_reload_failed",
                        obj(&[("error", v_str(&e.to_string()))]),
                    );
                }
                refresh_caches(&registry, &mut eliminations, &mut scores, &logger);
                check_drawdowns(&checker, &store, &mut eliminations, &logger);
            }
        }
    }

    logger.log(Level::Info, Domain::System, "shutdown_requested", obj(&[]));
    let _ = stop_tx.send(true);
    poller.await.context("update loop panicked")?;
    eliminations.flush()?;
    scores.flush()?;
    logger.log(Level::Info, Domain::System, "node_stop", obj(&[]));
    Ok(())
}

fn refresh_caches(
    registry: &FileRegistry,
    eliminations: &mut EliminationCache,
    scores: &mut QualityScoreCache,
    logger: &Logger,
) {
    let snapshot = registry.snapshot();
    if let Err(e) = eliminations.load_and_filter(&snapshot) {
        logger.log(
            Level::Error,
            Domain::Cache,
            "cache_refresh_failed",
            obj(&[("key", v_str(eliminations.key())), ("error", v_str(&e.to_string()))]),
        );
    }
    if let Err(e) = scores.load_and_filter(&snapshot) {
        logger.log(
            Level::Error,
            Domain::Cache,
            "cache_refresh_failed",
            obj(&[("key", v_str(scores.key())), ("error", v_str(&e.to_string()))]),
        );
    }
}

/// Eliminate every participant whose reported account values breach a limit.
/// Nothing to check until something has written the equity document.
fn check_drawdowns(
    checker: &MddChecker,
    store: &DurableJsonStore,
    eliminations: &mut EliminationCache,
    logger: &Logger,
) {
    let equity: BTreeMap<Identity, EquitySnapshot> = match store.read(EQUITY_KEY) {
        Ok(doc) => doc,
        Err(e) if e.is_missing() => return,
        Err(e) => {
            logger.log(
                Level::Error,
                Domain::Risk,
                "equity_unreadable",
                obj(&[("key", v_str(EQUITY_KEY)), ("error", v_str(&e.to_string()))]),
            );
            return;
        }
    };
    let newly = checker.check_all(eliminations, &equity, &chrono::Local::now());
    if newly.is_empty() {
        return;
    }
    logger.log(
        Level::Info,
        Domain::Risk,
        "drawdown_sweep",
        obj(&[
            ("checked", v_num(equity.len() as f64)),
            ("eliminated", v_num(newly.len() as f64)),
        ]),
    );
    if let Err(e) = eliminations.flush() {
        logger.log(
            Level::Error,
            Domain::Cache,
            "cache_flush_failed",
            obj(&[("key", v_str(eliminations.key())), ("error", v_str(&e.to_string()))]),
        );
    }
}
