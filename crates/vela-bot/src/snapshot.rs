//! Snapshot persistence for strategy state.
//!
//! The engine writes the whole strategy set to one JSON file on a timer
//! and on shutdown, and restores it on startup. Restore never fails the
//! process: a missing file starts fresh, a corrupt file or record is
//! logged and the affected strategies start fresh.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use vela_common::CurrencyPair;

use crate::group::StrategyGroup;
use crate::strategy::CoreSnapshot;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persisted state of one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub name: String,
    pub pair: CurrencyPair,
    pub core: CoreSnapshot,
    /// Strategy-specific state (timers, pending orders, windows).
    #[serde(default)]
    pub extra: Value,
}

/// On-disk snapshot format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub strategies: Vec<StrategySnapshot>,
}

/// Collect the current state of every strategy in every group.
pub fn capture(groups: &[&StrategyGroup]) -> SnapshotFile {
    let mut strategies = Vec::new();
    for group in groups {
        for strategy in group.iter() {
            strategies.push(StrategySnapshot {
                name: strategy.name().to_string(),
                pair: strategy.pair().clone(),
                core: strategy.core().snapshot(),
                extra: strategy.snapshot_extra(),
            });
        }
    }
    SnapshotFile {
        saved_at: Some(Utc::now()),
        strategies,
    }
}

/// Write a snapshot atomically: serialize to a sibling temp file, then
/// rename over the target.
pub fn save(path: &Path, snapshot: &SnapshotFile) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    info!(
        path = %path.display(),
        strategies = snapshot.strategies.len(),
        "Snapshot saved"
    );
    Ok(())
}

/// Load a snapshot. A missing file starts fresh; a corrupt file is
/// logged and discarded rather than failing startup.
pub fn load(path: &Path) -> SnapshotFile {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No snapshot file, starting fresh");
            return SnapshotFile::default();
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "Snapshot unreadable, starting fresh");
            return SnapshotFile::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(path = %path.display(), error = %err, "Snapshot corrupt, starting fresh");
            SnapshotFile::default()
        }
    }
}

/// Apply a snapshot to the live groups.
///
/// Records are matched by (pair, name); records with no live strategy
/// are dropped, invalid records are logged and the strategy keeps its
/// fresh state.
pub fn restore_into(snapshot: &SnapshotFile, groups: &mut [StrategyGroup]) -> usize {
    let mut restored = 0;
    for record in &snapshot.strategies {
        let Some(group) = groups.iter_mut().find(|g| *g.pair() == record.pair) else {
            warn!(
                pair = %record.pair,
                name = %record.name,
                "Snapshot record for an untracked pair, dropping"
            );
            continue;
        };
        let Some(strategy) = group.iter_mut().find(|s| s.name() == record.name) else {
            warn!(
                pair = %record.pair,
                name = %record.name,
                "Snapshot record for an unknown strategy, dropping"
            );
            continue;
        };
        if !record.core.is_valid() {
            error!(
                pair = %record.pair,
                name = %record.name,
                position = ?record.core.position,
                "Snapshot record inconsistent, strategy starts fresh"
            );
            continue;
        }
        strategy.core_mut().restore(&record.core);
        strategy.restore_extra(&record.extra);
        restored += 1;
    }
    info!(
        restored,
        total = snapshot.strategies.len(),
        "Snapshot restored"
    );
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::strategy::build_strategy;
    use crate::types::ExecutedTrade;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use vela_common::{PositionState, TradeAction};

    fn pair() -> CurrencyPair {
        CurrencyPair::new("BTC", "USD")
    }

    fn group_with_position() -> StrategyGroup {
        let mut group = StrategyGroup::new(pair());
        group
            .add(build_strategy("stop_loss", pair(), &StrategyConfig::default()).unwrap())
            .unwrap();
        group.on_trade(&ExecutedTrade {
            order_id: "o1".to_string(),
            pair: pair(),
            action: TradeAction::Buy,
            rate: dec!(100),
            amount: dec!(2),
            timestamp: Utc::now(),
        });
        group
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategies.json");

        let group = group_with_position();
        save(&path, &capture(&[&group])).unwrap();

        let mut fresh = StrategyGroup::new(pair());
        fresh
            .add(build_strategy("stop_loss", pair(), &StrategyConfig::default()).unwrap())
            .unwrap();
        let restored = restore_into(&load(&path), std::slice::from_mut(&mut fresh));
        assert_eq!(restored, 1);

        let core = fresh.get("stop_loss").unwrap().core();
        assert_eq!(core.position(), PositionState::Long);
        assert_eq!(core.entry_price(), dec!(100));
        assert_eq!(core.position_amount(), dec!(2));
    }

    #[test]
    fn test_missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = load(&dir.path().join("nope.json"));
        assert!(snapshot.strategies.is_empty());
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategies.json");
        std::fs::write(&path, "{\"saved_at\": trunca").unwrap();
        let snapshot = load(&path);
        assert!(snapshot.strategies.is_empty());
    }

    #[test]
    fn test_invalid_record_keeps_fresh_state() {
        let group = group_with_position();
        let mut snapshot = capture(&[&group]);
        // Open position but a cleared entry price: inconsistent.
        snapshot.strategies[0].core.entry_price = crate::strategy::core::NO_PRICE;

        let mut fresh = StrategyGroup::new(pair());
        fresh
            .add(build_strategy("stop_loss", pair(), &StrategyConfig::default()).unwrap())
            .unwrap();
        let restored = restore_into(&snapshot, std::slice::from_mut(&mut fresh));
        assert_eq!(restored, 0);
        assert_eq!(
            fresh.get("stop_loss").unwrap().core().position(),
            PositionState::None
        );
    }

    #[test]
    fn test_unknown_strategy_record_dropped() {
        let group = group_with_position();
        let snapshot = capture(&[&group]);

        let mut fresh = StrategyGroup::new(pair());
        fresh
            .add(build_strategy("take_profit", pair(), &StrategyConfig::default()).unwrap())
            .unwrap();
        assert_eq!(restore_into(&snapshot, std::slice::from_mut(&mut fresh)), 0);
    }

    #[test]
    fn test_extra_state_round_trips() {
        let settings = StrategyConfig::default();
        let mut group = StrategyGroup::new(pair());
        group
            .add(build_strategy("stop_loss", pair(), &settings).unwrap())
            .unwrap();
        let snapshot = capture(&[&group]);
        assert!(snapshot.strategies[0].extra.is_object());
    }
}
