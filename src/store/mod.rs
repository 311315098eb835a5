//! SQLite persistence: players, games, events, pending events and analyses.

mod batch;
mod schema;

pub use batch::BatchTx;
pub use schema::SCHEMA_VERSION;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::derive::{GameAnalysis, PlayerAnalysis};
use crate::error::Result;
use crate::logging::{log, obj, Domain, Level};
use crate::normalize::{ActionKind, EventCandidate};
use serde_json::json;

pub(crate) const GAME_COLUMNS: &str = "game_key, server, game_number, start_ms, end_ms, last_event_ms, \
     ended, truncated, seeding, map, mode, duration_secs, allied_score, axis_score, winner";

const EVENT_COLUMNS: &str = "event_id, source_id, fingerprint, payload_hash, server, event_ms, kind, \
     raw_type, actor_id, actor_name, target_id, target_name, weapon, content, game_key, superseded, superseded_by";

const ANALYSIS_COLUMNS: &str = "game_key, version, player_id, kills, deaths, team_kills, team_deaths, \
     seconds_played, kpm, dpm, ratio, truncated, weapon_kills, weapon_deaths, victims, nemeses, \
     kill_distribution, death_distribution, team_kill_distribution, team_death_distribution";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameRecord {
    pub game_key: String,
    pub server: String,
    pub game_number: i64,
    pub start_ms: i64,
    pub end_ms: Option<i64>,
    pub last_event_ms: i64,
    pub ended: bool,
    pub truncated: bool,
    pub seeding: bool,
    pub map: Option<String>,
    pub mode: Option<String>,
    pub duration_secs: Option<i64>,
    pub allied_score: Option<u32>,
    pub axis_score: Option<u32>,
    pub winner: Option<String>,
}

impl GameRecord {
    pub fn is_open(&self) -> bool {
        self.end_ms.is_none()
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            game_key: row.get(0)?,
            server: row.get(1)?,
            game_number: row.get(2)?,
            start_ms: row.get(3)?,
            end_ms: row.get(4)?,
            last_event_ms: row.get(5)?,
            ended: row.get(6)?,
            truncated: row.get(7)?,
            seeding: row.get(8)?,
            map: row.get(9)?,
            mode: row.get(10)?,
            duration_secs: row.get(11)?,
            allied_score: row.get(12)?,
            axis_score: row.get(13)?,
            winner: row.get(14)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub event_id: i64,
    pub source_id: Option<String>,
    pub fingerprint: String,
    pub payload_hash: String,
    pub server: String,
    pub event_ms: i64,
    #[serde(skip)]
    pub kind: ActionKind,
    pub raw_type: String,
    pub actor_id: Option<String>,
    pub actor_name: Option<String>,
    pub target_id: Option<String>,
    pub target_name: Option<String>,
    pub weapon: Option<String>,
    pub content: Option<String>,
    pub game_key: String,
    pub superseded: bool,
    pub superseded_by: Option<i64>,
}

impl StoredEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get(6)?;
        Ok(Self {
            event_id: row.get(0)?,
            source_id: row.get(1)?,
            fingerprint: row.get(2)?,
            payload_hash: row.get(3)?,
            server: row.get(4)?,
            event_ms: row.get(5)?,
            kind: ActionKind::parse(&kind).unwrap_or(ActionKind::Other),
            raw_type: row.get(7)?,
            actor_id: row.get(8)?,
            actor_name: row.get(9)?,
            target_id: row.get(10)?,
            target_name: row.get(11)?,
            weapon: row.get(12)?,
            content: row.get(13)?,
            game_key: row.get(14)?,
            superseded: row.get(15)?,
            superseded_by: row.get(16)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerRecord {
    pub player_id: String,
    pub current_name: String,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
}

/// A candidate held back because no game could take it.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub candidate: EventCandidate,
    pub held_at: String,
    pub attempts: u32,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let mut store = Self { conn: Connection::open(path)? };
        let _mode: String = store
            .conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get(0))?;
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self { conn: Connection::open_in_memory()? };
        store.init()?;
        Ok(store)
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.pragma_update(None, "foreign_keys", true)?;
        let found: i64 = self.conn.pragma_query_value(None, "user_version", |r| r.get(0))?;
        if found == 1 {
            self.conn.execute_batch(&format!("BEGIN;{}COMMIT;", schema::MIGRATE_V2))?;
        }
        self.conn.execute_batch(&format!("BEGIN;{}COMMIT;", schema::SCHEMA))?;
        if found < SCHEMA_VERSION {
            self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            log(
                Level::Info,
                Domain::Store,
                "schema_ready",
                obj(&[("from", json!(found)), ("to", json!(SCHEMA_VERSION))]),
            );
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Start the single transaction that one reconciled batch is written in.
    pub fn begin_batch(&mut self) -> Result<BatchTx<'_>> {
        Ok(BatchTx::new(self.conn.transaction()?))
    }

    // -------------------------------------------------------------------------
    // Games
    // -------------------------------------------------------------------------

    pub fn game(&self, game_key: &str) -> Result<Option<GameRecord>> {
        let sql = format!("SELECT {} FROM games WHERE game_key = ?1", GAME_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![game_key], GameRecord::from_row)
            .optional()?)
    }

    pub fn games(&self) -> Result<Vec<GameRecord>> {
        self.query_games("1 = 1", params![])
    }

    pub fn open_games(&self) -> Result<Vec<GameRecord>> {
        self.query_games("end_ms IS NULL", params![])
    }

    pub fn closed_games(&self) -> Result<Vec<GameRecord>> {
        self.query_games("end_ms IS NOT NULL", params![])
    }

    /// Games the player took part in, optionally bounded by start time.
    pub fn games_for_player(
        &self,
        player_id: &str,
        from_ms: Option<i64>,
        to_ms: Option<i64>,
    ) -> Result<Vec<GameRecord>> {
        self.query_games(
            "game_key IN (SELECT game_key FROM game_players WHERE player_id = ?1) \
             AND (?2 IS NULL OR start_ms >= ?2) AND (?3 IS NULL OR start_ms <= ?3)",
            params![player_id, from_ms, to_ms],
        )
    }

    fn query_games(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<GameRecord>> {
        let sql = format!(
            "SELECT {} FROM games WHERE {} ORDER BY start_ms, game_key",
            GAME_COLUMNS, filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(args, GameRecord::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn players_in_game(&self, game_key: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT player_id FROM game_players WHERE game_key = ?1 ORDER BY player_id")?;
        let rows = stmt.query_map(params![game_key], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    // -------------------------------------------------------------------------
    // Events and players
    // -------------------------------------------------------------------------

    /// Events of a game ordered by time. Superseded rows only when asked for.
    pub fn events_for_game(&self, game_key: &str, include_superseded: bool) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "SELECT {} FROM events WHERE game_key = ?1 AND (?2 OR superseded = 0) \
             ORDER BY event_ms, event_id",
            EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![game_key, include_superseded], StoredEvent::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn events_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "SELECT {} FROM events WHERE fingerprint = ?1 ORDER BY event_id",
            EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![fingerprint], StoredEvent::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn event_count(&self, include_superseded: bool) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE (?1 OR superseded = 0)",
            params![include_superseded],
            |r| r.get(0),
        )?)
    }

    pub fn player(&self, player_id: &str) -> Result<Option<PlayerRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT player_id, current_name, first_seen_ms, last_seen_ms FROM players WHERE player_id = ?1",
                params![player_id],
                |r| {
                    Ok(PlayerRecord {
                        player_id: r.get(0)?,
                        current_name: r.get(1)?,
                        first_seen_ms: r.get(2)?,
                        last_seen_ms: r.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    /// Every name the player has been seen with, oldest first.
    pub fn player_names(&self, player_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM player_names WHERE player_id = ?1 ORDER BY first_seen_ms, name",
        )?;
        let rows = stmt.query_map(params![player_id], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    pub fn pending_events(&self) -> Result<Vec<PendingEvent>> {
        batch::load_pending(&self.conn)
    }

    // -------------------------------------------------------------------------
    // Analyses
    // -------------------------------------------------------------------------

    pub fn latest_analysis_version(&self, player_id: &str, game_key: &str) -> Result<Option<u32>> {
        Ok(self.conn.query_row(
            "SELECT MAX(version) FROM player_analyses WHERE player_id = ?1 AND game_key = ?2",
            params![player_id, game_key],
            |r| r.get(0),
        )?)
    }

    pub fn analysis_digest(&self, game_key: &str, version: u32) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT input_digest FROM game_analyses WHERE game_key = ?1 AND version = ?2",
                params![game_key, version],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn analyses_for_game(&self, game_key: &str, version: u32) -> Result<Vec<PlayerAnalysis>> {
        let sql = format!(
            "SELECT {} FROM player_analyses WHERE game_key = ?1 AND version = ?2 ORDER BY player_id",
            ANALYSIS_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![game_key, version], analysis_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Closed games with no analysis header at `version`.
    pub fn games_missing_analysis(&self, version: u32) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT game_key FROM games g WHERE end_ms IS NOT NULL AND NOT EXISTS \
             (SELECT 1 FROM game_analyses a WHERE a.game_key = g.game_key AND a.version = ?1) \
             ORDER BY start_ms, game_key",
        )?;
        let rows = stmt.query_map(params![version], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    /// Replace every analysis row of `(game, version)` in one transaction.
    pub fn replace_analysis(&mut self, analysis: &GameAnalysis) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM player_analyses WHERE game_key = ?1 AND version = ?2",
            params![analysis.game_key, analysis.version],
        )?;
        tx.execute(
            "DELETE FROM game_analyses WHERE game_key = ?1 AND version = ?2",
            params![analysis.game_key, analysis.version],
        )?;
        tx.execute(
            "INSERT INTO game_analyses (game_key, version, input_digest, players, truncated) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                analysis.game_key,
                analysis.version,
                analysis.input_digest,
                analysis.players.len() as i64,
                analysis.truncated
            ],
        )?;
        {
            let sql = format!(
                "INSERT INTO player_analyses ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                ANALYSIS_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            for p in &analysis.players {
                stmt.execute(params![
                    p.game_key,
                    p.version,
                    p.player_id,
                    p.kills,
                    p.deaths,
                    p.team_kills,
                    p.team_deaths,
                    p.seconds_played,
                    p.kpm,
                    p.dpm,
                    p.ratio,
                    p.truncated,
                    serde_json::to_string(&p.weapon_kills)?,
                    serde_json::to_string(&p.weapon_deaths)?,
                    serde_json::to_string(&p.victims)?,
                    serde_json::to_string(&p.nemeses)?,
                    serde_json::to_string(&p.kill_distribution)?,
                    serde_json::to_string(&p.death_distribution)?,
                    serde_json::to_string(&p.team_kill_distribution)?,
                    serde_json::to_string(&p.team_death_distribution)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(analysis.players.len())
    }

    /// Drop every analysis stamped with `version`.
    pub fn purge_version(&mut self, version: u32) -> Result<usize> {
        self.purge_where("version = ?1", version)
    }

    /// Drop every analysis stamped with a version below `version`.
    pub fn purge_older_than(&mut self, version: u32) -> Result<usize> {
        self.purge_where("version < ?1", version)
    }

    fn purge_where(&mut self, filter: &str, version: u32) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let rows = tx.execute(
            &format!("DELETE FROM player_analyses WHERE {}", filter),
            params![version],
        )?;
        tx.execute(&format!("DELETE FROM game_analyses WHERE {}", filter), params![version])?;
        tx.commit()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Processed files
    // -------------------------------------------------------------------------

    pub fn is_file_processed(&self, sha256: &str) -> Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM processed_files WHERE sha256 = ?1",
                params![sha256],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    pub fn mark_file_processed(&self, sha256: &str, name: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO processed_files (sha256, name, ingested_at) VALUES (?1, ?2, ?3)",
            params![sha256, name, crate::logging::ts_now()],
        )?;
        Ok(())
    }
}

fn analysis_from_row(row: &Row<'_>) -> rusqlite::Result<PlayerAnalysis> {
    Ok(PlayerAnalysis {
        game_key: row.get(0)?,
        version: row.get(1)?,
        player_id: row.get(2)?,
        kills: row.get(3)?,
        deaths: row.get(4)?,
        team_kills: row.get(5)?,
        team_deaths: row.get(6)?,
        seconds_played: row.get(7)?,
        kpm: row.get(8)?,
        dpm: row.get(9)?,
        ratio: row.get(10)?,
        truncated: row.get(11)?,
        weapon_kills: json_map(row, 12)?,
        weapon_deaths: json_map(row, 13)?,
        victims: json_map(row, 14)?,
        nemeses: json_map(row, 15)?,
        kill_distribution: json_map(row, 16)?,
        death_distribution: json_map(row, 17)?,
        team_kill_distribution: json_map(row, 18)?,
        team_death_distribution: json_map(row, 19)?,
    })
}

fn json_map<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
