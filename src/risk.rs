//! Drawdown limits and elimination on breach.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

use crate::cache::{EliminationCache, EliminationReason, EliminationRow};
use crate::error::{ensure_finite, ValidationError};
use crate::logging::{obj, v_num, v_str, Domain, Level, Logger};
use crate::types::Identity;

/// Store key of the per-participant account values the node checks on each refresh.
pub const EQUITY_KEY: &str = "equity_snapshots";

/// Reference and current account value for one participant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub initial_value: f64,
    pub final_value: f64,
}

impl EquitySnapshot {
    pub fn drawdown(&self) -> Result<f64, ValidationError> {
        calculate_drawdown(self.final_value, self.initial_value)
    }
}

#[derive(Debug, Clone)]
pub struct DrawdownConfig {
    pub max_daily_drawdown: f64,
    pub max_total_drawdown: f64,
    /// Minutes after local midnight during which the daily limit applies.
    pub daily_window_minutes: u32,
}

impl Default for DrawdownConfig {
    fn default() -> Self {
        Self {
            max_daily_drawdown: 0.95,
            max_total_drawdown: 0.90,
            daily_window_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachKind {
    MaxDailyDrawdown,
    MaxTotalDrawdown,
}

impl BreachKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachKind::MaxDailyDrawdown => "MAX_DAILY_DRAWDOWN",
            BreachKind::MaxTotalDrawdown => "MAX_TOTAL_DRAWDOWN",
        }
    }
}

impl From<BreachKind> for EliminationReason {
    fn from(kind: BreachKind) -> Self {
        match kind {
            BreachKind::MaxDailyDrawdown => EliminationReason::MaxDailyDrawdown,
            BreachKind::MaxTotalDrawdown => EliminationReason::MaxTotalDrawdown,
        }
    }
}

/// `1 + (final - initial) / initial`. Below 1 is a loss.
pub fn calculate_drawdown(final_value: f64, initial_value: f64) -> Result<f64, ValidationError> {
    let final_value = ensure_finite("final_value", final_value)?;
    let initial_value = ensure_finite("initial_value", initial_value)?;
    if initial_value <= 0.0 {
        return Err(ValidationError::NotPositive {
            field: "initial_value",
            value: initial_value,
        });
    }
    Ok(1.0 + (final_value - initial_value) / initial_value)
}

pub struct DrawdownClassifier {
    cfg: DrawdownConfig,
}

impl DrawdownClassifier {
    pub fn new(cfg: DrawdownConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &DrawdownConfig {
        &self.cfg
    }

    /// Whether `now` falls in the reset window just after midnight in its own zone.
    pub fn in_daily_window<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        now.hour() == 0 && now.minute() < self.cfg.daily_window_minutes
    }

    /// The daily limit is checked first but only inside the reset window;
    /// outside it the total limit alone applies. Both comparisons are strict.
    pub fn classify<Tz: TimeZone>(
        &self,
        ratio: f64,
        now: &DateTime<Tz>,
    ) -> Result<Option<BreachKind>, ValidationError> {
        let ratio = ensure_finite("drawdown_ratio", ratio)?;
        if ratio < self.cfg.max_daily_drawdown && self.in_daily_window(now) {
            return Ok(Some(BreachKind::MaxDailyDrawdown));
        }
        if ratio < self.cfg.max_total_drawdown {
            return Ok(Some(BreachKind::MaxTotalDrawdown));
        }
        Ok(None)
    }
}

/// Turns classified breaches into elimination rows.
pub struct MddChecker {
    classifier: DrawdownClassifier,
    logger: Logger,
}

impl MddChecker {
    pub fn new(cfg: DrawdownConfig, logger: Logger) -> Self {
        Self {
            classifier: DrawdownClassifier::new(cfg),
            logger,
        }
    }

    pub fn classifier(&self) -> &DrawdownClassifier {
        &self.classifier
    }

    /// Classify `ratio` at `now`; on breach, append a row unless `identity`
    /// is already eliminated. The row is only in memory until the cache is flushed.
    pub fn check<Tz: TimeZone>(
        &self,
        eliminations: &mut EliminationCache,
        identity: &Identity,
        ratio: f64,
        now: &DateTime<Tz>,
    ) -> Result<Option<BreachKind>, ValidationError> {
        let Some(kind) = self.classifier.classify(ratio, now)? else {
            return Ok(None);
        };
        if eliminations.is_eliminated(identity) {
            self.logger.log(
                Level::Debug,
                Domain::Risk,
                "breach_already_eliminated",
                obj(&[("identity", v_str(identity.as_str())), ("reason", v_str(kind.as_str()))]),
            );
            return Ok(Some(kind));
        }
        self.logger.log(
            Level::Warn,
            Domain::Risk,
            "drawdown_breach",
            obj(&[
                ("identity", v_str(identity.as_str())),
                ("reason", v_str(kind.as_str())),
                ("ratio", v_num(ratio)),
            ]),
        );
        eliminations.append(EliminationRow {
            identity: identity.clone(),
            initiated_time_ms: now.timestamp_millis().max(0) as u64,
            drawdown_value: ratio,
            reason: kind.into(),
        });
        Ok(Some(kind))
    }

    /// Check every reported participant and return the ones newly eliminated.
    /// Entries with unusable values are logged and skipped.
    pub fn check_all<Tz: TimeZone>(
        &self,
        eliminations: &mut EliminationCache,
        equity: &BTreeMap<Identity, EquitySnapshot>,
        now: &DateTime<Tz>,
    ) -> Vec<(Identity, BreachKind)> {
        let mut newly = Vec::new();
        for (identity, snap) in equity {
            let already = eliminations.is_eliminated(identity);
            let checked = snap
                .drawdown()
                .and_then(|ratio| self.check(eliminations, identity, ratio, now));
            match checked {
                Ok(Some(kind)) if !already => newly.push((identity.clone(), kind)),
                Ok(_) => {}
                Err(e) => self.logger.log(
                    Level::Warn,
                    Domain::Risk,
                    "equity_rejected",
                    obj(&[("identity", v_str(identity.as_str())), ("error", v_str(&e.to_string()))]),
                ),
            }
        }
        newly
    }
}
