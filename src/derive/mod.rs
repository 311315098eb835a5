//! Versioned per-player metric derivation.
//!
//! Analyses are keyed by `(game, player, version)`. A derivation run for one version replaces
//! every row of that version for the games it touches and never reads or writes other versions,
//! so fixing the logic means registering a new [`LogicVersion`] and rerunning.

pub mod logic;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use logic::{LogicVersion, CURRENT_VERSION};

use crate::config::Config;
use crate::error::Result;
use crate::logging::{log, log_audit, obj, Domain, Level, ProfileScope};
use crate::store::Store;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerAnalysis {
    pub game_key: String,
    pub player_id: String,
    pub version: u32,
    pub kills: u32,
    pub deaths: u32,
    pub team_kills: u32,
    pub team_deaths: u32,
    pub seconds_played: f64,
    pub kpm: f64,
    pub dpm: f64,
    pub ratio: f64,
    /// The game was closed without an end marker.
    pub truncated: bool,
    pub weapon_kills: BTreeMap<String, u32>,
    pub weapon_deaths: BTreeMap<String, u32>,
    pub victims: BTreeMap<String, u32>,
    pub nemeses: BTreeMap<String, u32>,
    /// Whole seconds since game start mapped to the players killed at that offset.
    pub kill_distribution: BTreeMap<i64, Vec<String>>,
    /// Offset mapped to the killers.
    pub death_distribution: BTreeMap<i64, Vec<String>>,
    pub team_kill_distribution: BTreeMap<i64, Vec<String>>,
    pub team_death_distribution: BTreeMap<i64, Vec<String>>,
}

impl PlayerAnalysis {
    pub fn minutes_played(&self) -> f64 {
        self.seconds_played / 60.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameAnalysis {
    pub game_key: String,
    pub version: u32,
    pub input_digest: String,
    pub truncated: bool,
    pub players: Vec<PlayerAnalysis>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeriveReport {
    pub derived: Vec<String>,
    pub unchanged: usize,
    pub skipped_open: usize,
    pub skipped_seeding: usize,
    pub missing: usize,
    pub rows_written: usize,
}

impl DeriveReport {
    pub fn merge(&mut self, other: DeriveReport) {
        self.derived.extend(other.derived);
        self.unchanged += other.unchanged;
        self.skipped_open += other.skipped_open;
        self.skipped_seeding += other.skipped_seeding;
        self.missing += other.missing;
        self.rows_written += other.rows_written;
    }
}

enum Outcome {
    Ready(GameAnalysis),
    Open,
    Seeding,
    Missing,
}

pub struct DerivationEngine {
    version: LogicVersion,
    warmup_ms: i64,
    skip_seeding: bool,
}

impl DerivationEngine {
    pub fn new(version: u32, warmup_secs: i64) -> Result<Self> {
        Ok(Self {
            version: LogicVersion::from_number(version)?,
            warmup_ms: warmup_secs.max(0) * 1000,
            skip_seeding: false,
        })
    }

    pub fn with_skip_seeding(mut self, skip: bool) -> Self {
        self.skip_seeding = skip;
        self
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self::new(cfg.derivation_version, cfg.warmup_secs)?.with_skip_seeding(cfg.skip_seeding))
    }

    pub fn version(&self) -> u32 {
        self.version.number()
    }

    /// Compute without writing. `None` for games that are open, seeding (when skipped) or unknown.
    pub fn analyze(&self, store: &Store, game_key: &str) -> Result<Option<GameAnalysis>> {
        Ok(match self.prepare(store, game_key)? {
            Outcome::Ready(analysis) => Some(analysis),
            _ => None,
        })
    }

    fn prepare(&self, store: &Store, game_key: &str) -> Result<Outcome> {
        let Some(game) = store.game(game_key)? else {
            return Ok(Outcome::Missing);
        };
        let Some(end_ms) = game.end_ms else {
            return Ok(Outcome::Open);
        };
        if self.skip_seeding && game.seeding {
            return Ok(Outcome::Seeding);
        }
        let events = store.events_for_game(game_key, false)?;
        let version = self.version();
        let input_digest = logic::input_digest(&game, end_ms, &events, version, self.warmup_ms);
        let players = logic::analyze_game(&game, end_ms, &events, self.version, self.warmup_ms);
        Ok(Outcome::Ready(GameAnalysis {
            game_key: game.game_key,
            version,
            input_digest,
            truncated: game.truncated,
            players,
        }))
    }

    /// Replace the analyses of `keys` at this engine's version. Without `force`, games whose
    /// stored digest matches the current inputs are left alone.
    pub fn derive_games(&self, store: &mut Store, keys: &[String], force: bool) -> Result<DeriveReport> {
        let _p = ProfileScope::with_context(
            "derive_games",
            &[("games", json!(keys.len())), ("version", json!(self.version()))],
        );
        let mut report = DeriveReport::default();
        for key in keys {
            let analysis = match self.prepare(store, key)? {
                Outcome::Ready(a) => a,
                Outcome::Open => {
                    report.skipped_open += 1;
                    continue;
                }
                Outcome::Seeding => {
                    report.skipped_seeding += 1;
                    continue;
                }
                Outcome::Missing => {
                    report.missing += 1;
                    continue;
                }
            };
            if !force && store.analysis_digest(key, analysis.version)?.as_deref() == Some(analysis.input_digest.as_str()) {
                report.unchanged += 1;
                continue;
            }
            let rows = store.replace_analysis(&analysis)?;
            log_audit(key, analysis.version, &analysis.input_digest, rows);
            report.rows_written += rows;
            report.derived.push(key.clone());
        }
        log(
            Level::Info,
            Domain::Derive,
            "derive_done",
            obj(&[
                ("version", json!(self.version())),
                ("force", json!(force)),
                ("derived", json!(report.derived.len())),
                ("unchanged", json!(report.unchanged)),
                ("skipped_open", json!(report.skipped_open)),
                ("skipped_seeding", json!(report.skipped_seeding)),
                ("rows", json!(report.rows_written)),
            ]),
        );
        Ok(report)
    }

    /// Every closed game.
    pub fn derive_all(&self, store: &mut Store, force: bool) -> Result<DeriveReport> {
        let keys: Vec<String> = store.closed_games()?.into_iter().map(|g| g.game_key).collect();
        self.derive_games(store, &keys, force)
    }

    /// Closed games with no analysis at this version yet, e.g. after a crash between commit
    /// and derivation.
    pub fn derive_outstanding(&self, store: &mut Store) -> Result<DeriveReport> {
        let keys = store.games_missing_analysis(self.version())?;
        let report = self.derive_games(store, &keys, false)?;
        if report.skipped_seeding > 0 {
            log(
                Level::Debug,
                Domain::Derive,
                "seeding_games_left_underived",
                obj(&[("count", json!(report.skipped_seeding))]),
            );
        }
        Ok(report)
    }
}
