use rusqlite::{params, Connection, OptionalExtension, Transaction};

use super::PendingEvent;
use crate::error::Result;
use crate::logging::ts_now;
use crate::normalize::{ActionKind, EventCandidate, PlayerRef};
use crate::reconcile::{FingerprintIndex, StoredVersion};
use crate::session::{Closure, NewGame, OpenGame, SessionBackend};

const UNKNOWN_NAME: &str = "<unknown>";

/// Writes of one reconciled batch. Nothing is visible until [`BatchTx::commit`]; dropping the
/// value rolls everything back.
pub struct BatchTx<'a> {
    tx: Transaction<'a>,
}

impl<'a> BatchTx<'a> {
    pub(crate) fn new(tx: Transaction<'a>) -> Self {
        Self { tx }
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    /// Store a live event in `game_key`. Players are created or refreshed first.
    pub fn insert_event(&mut self, c: &EventCandidate, game_key: &str) -> Result<i64> {
        self.insert_row(c, game_key, None)
    }

    /// Store an event that a later event of the same batch already replaces.
    pub fn insert_superseded(&mut self, c: &EventCandidate, game_key: &str, by: i64) -> Result<i64> {
        self.insert_row(c, game_key, Some(by))
    }

    /// Supersede the live row `old_id` with `c`. The new row keeps the old row's game.
    pub fn replace_event(&mut self, old_id: i64, c: &EventCandidate, game_key: &str) -> Result<i64> {
        self.tx.execute(
            "UPDATE events SET superseded = 1 WHERE event_id = ?1",
            params![old_id],
        )?;
        let new_id = self.insert_row(c, game_key, None)?;
        self.tx.execute(
            "UPDATE events SET superseded_by = ?2 WHERE event_id = ?1",
            params![old_id, new_id],
        )?;
        self.touch_game(game_key, c.at_ms())?;
        Ok(new_id)
    }

    fn insert_row(&mut self, c: &EventCandidate, game_key: &str, superseded_by: Option<i64>) -> Result<i64> {
        let at = c.at_ms();
        if let Some(actor) = &c.actor {
            self.upsert_player(actor, at)?;
        }
        if let Some(target) = c.target() {
            self.upsert_player(target, at)?;
        }
        self.tx.execute(
            "INSERT INTO events (source_id, fingerprint, payload_hash, server, event_ms, kind, raw_type, \
             actor_id, actor_name, target_id, target_name, weapon, content, raw, game_key, \
             superseded, superseded_by, inserted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                c.source_id,
                c.fingerprint,
                c.payload_hash,
                c.server,
                at,
                c.action().as_str(),
                c.raw_type,
                c.actor_id(),
                c.actor.as_ref().and_then(|p| p.name.as_deref()),
                c.target_id(),
                c.target().and_then(|p| p.name.as_deref()),
                c.weapon(),
                c.content,
                c.raw,
                game_key,
                superseded_by.is_some(),
                superseded_by,
                ts_now(),
            ],
        )?;
        let id = self.tx.last_insert_rowid();
        for player in [c.actor_id(), c.target_id()].into_iter().flatten() {
            self.tx.execute(
                "INSERT OR IGNORE INTO game_players (game_key, player_id) VALUES (?1, ?2)",
                params![game_key, player],
            )?;
        }
        Ok(id)
    }

    /// Current name follows the newest event; a real name always beats the placeholder.
    fn upsert_player(&mut self, p: &PlayerRef, at: i64) -> Result<()> {
        self.tx.execute(
            "INSERT INTO players (player_id, current_name, first_seen_ms, last_seen_ms) \
             VALUES (?1, COALESCE(?2, ?4), ?3, ?3) \
             ON CONFLICT(player_id) DO UPDATE SET \
               current_name = CASE \
                 WHEN ?2 IS NOT NULL AND (?3 >= players.last_seen_ms OR players.current_name = ?4) THEN ?2 \
                 ELSE players.current_name END, \
               first_seen_ms = MIN(players.first_seen_ms, ?3), \
               last_seen_ms = MAX(players.last_seen_ms, ?3)",
            params![p.id, p.name, at, UNKNOWN_NAME],
        )?;
        if let Some(name) = &p.name {
            self.tx.execute(
                "INSERT INTO player_names (player_id, name, first_seen_ms) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(player_id, name) DO UPDATE SET \
                 first_seen_ms = MIN(player_names.first_seen_ms, excluded.first_seen_ms)",
                params![p.id, name, at],
            )?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pending
    // -------------------------------------------------------------------------

    pub fn pending(&self) -> Result<Vec<PendingEvent>> {
        load_pending(&self.tx)
    }

    /// Hold an unplaceable candidate. Holding it again counts another attempt.
    pub fn hold_pending(&mut self, c: &EventCandidate) -> Result<()> {
        self.tx.execute(
            "INSERT INTO pending_events (fingerprint, payload_hash, server, event_ms, candidate, held_at, attempts) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1) \
             ON CONFLICT(fingerprint, payload_hash) DO UPDATE SET attempts = pending_events.attempts + 1",
            params![
                c.fingerprint,
                c.payload_hash,
                c.server,
                c.at_ms(),
                serde_json::to_string(c)?,
                ts_now()
            ],
        )?;
        Ok(())
    }

    pub fn release_pending(&mut self, fingerprint: &str, payload_hash: &str) -> Result<bool> {
        let n = self.tx.execute(
            "DELETE FROM pending_events WHERE fingerprint = ?1 AND payload_hash = ?2",
            params![fingerprint, payload_hash],
        )?;
        Ok(n > 0)
    }
}

pub(crate) fn load_pending(conn: &Connection) -> Result<Vec<PendingEvent>> {
    let mut stmt = conn.prepare(
        "SELECT candidate, held_at, attempts FROM pending_events ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, u32>(2)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (json, held_at, attempts) = row?;
        out.push(PendingEvent {
            candidate: serde_json::from_str(&json)?,
            held_at,
            attempts,
        });
    }
    Ok(out)
}

impl FingerprintIndex for BatchTx<'_> {
    fn versions(&mut self, fingerprint: &str) -> Result<Vec<StoredVersion>> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT event_id, payload_hash, superseded, server, kind, actor_id, target_id, game_key, event_ms \
             FROM events WHERE fingerprint = ?1 ORDER BY event_id",
        )?;
        let rows = stmt.query_map(params![fingerprint], |r| {
            let superseded: bool = r.get(2)?;
            let kind: String = r.get(4)?;
            Ok(StoredVersion {
                event_id: r.get(0)?,
                payload_hash: r.get(1)?,
                live: !superseded,
                server: r.get(3)?,
                event_ms: r.get(8)?,
                action: ActionKind::parse(&kind).unwrap_or(ActionKind::Other),
                actor_id: r.get(5)?,
                target_id: r.get(6)?,
                game_key: r.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn open_game_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<OpenGame> {
    Ok(OpenGame {
        game_key: r.get(0)?,
        server: r.get(1)?,
        start_ms: r.get(2)?,
        last_event_ms: r.get(3)?,
    })
}

impl SessionBackend for BatchTx<'_> {
    fn open_game(&mut self, server: &str) -> Result<Option<OpenGame>> {
        Ok(self
            .tx
            .query_row(
                "SELECT game_key, server, start_ms, last_event_ms FROM games \
                 WHERE server = ?1 AND end_ms IS NULL ORDER BY start_ms DESC LIMIT 1",
                params![server],
                open_game_from_row,
            )
            .optional()?)
    }

    fn enclosing_game(&mut self, server: &str, at_ms: i64) -> Result<Option<String>> {
        Ok(self
            .tx
            .query_row(
                "SELECT game_key FROM games WHERE server = ?1 AND start_ms <= ?2 \
                 AND (end_ms IS NULL OR end_ms >= ?2) \
                 ORDER BY start_ms DESC, game_number DESC LIMIT 1",
                params![server, at_ms],
                |r| r.get(0),
            )
            .optional()?)
    }

    fn open_games(&mut self) -> Result<Vec<OpenGame>> {
        let mut stmt = self.tx.prepare(
            "SELECT game_key, server, start_ms, last_event_ms FROM games \
             WHERE end_ms IS NULL ORDER BY server, start_ms",
        )?;
        let rows = stmt.query_map([], open_game_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn create_game(&mut self, game: &NewGame) -> Result<String> {
        let n: i64 = self.tx.query_row(
            "SELECT COALESCE(MAX(game_number), 0) + 1 FROM games WHERE server = ?1",
            params![game.server],
            |r| r.get(0),
        )?;
        let key = format!("{}_{}", game.server, n);
        self.tx.execute(
            "INSERT INTO games (game_key, server, game_number, start_ms, last_event_ms, map, mode) \
             VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6)",
            params![key, game.server, n, game.start_ms, game.map, game.mode],
        )?;
        Ok(key)
    }

    fn close_game(&mut self, game_key: &str, closure: &Closure) -> Result<()> {
        match closure {
            Closure::Ended { end_ms, map, allied_score, axis_score } => {
                let winner = match (allied_score, axis_score) {
                    (Some(a), Some(b)) if a > b => Some("allies"),
                    (Some(a), Some(b)) if a < b => Some("axis"),
                    (Some(_), Some(_)) => Some("draw"),
                    _ => None,
                };
                self.tx.execute(
                    "UPDATE games SET end_ms = ?2, ended = 1, truncated = 0, \
                     duration_secs = (?2 - start_ms) / 1000, map = COALESCE(map, ?3), \
                     allied_score = ?4, axis_score = ?5, winner = ?6 WHERE game_key = ?1",
                    params![game_key, end_ms, map, allied_score, axis_score, winner],
                )?;
            }
            Closure::Truncated { end_ms, .. } => {
                self.tx.execute(
                    "UPDATE games SET end_ms = ?2, truncated = 1, \
                     duration_secs = (?2 - start_ms) / 1000 WHERE game_key = ?1",
                    params![game_key, end_ms],
                )?;
            }
        }
        Ok(())
    }

    fn touch_game(&mut self, game_key: &str, at_ms: i64) -> Result<()> {
        self.tx.execute(
            "UPDATE games SET last_event_ms = MAX(last_event_ms, ?2) WHERE game_key = ?1",
            params![game_key, at_ms],
        )?;
        Ok(())
    }

    fn mark_seeding(&mut self, game_key: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE games SET seeding = 1 WHERE game_key = ?1",
            params![game_key],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::normalize::{EventKind, PlayerRef};
    use crate::session::{Closure, NewGame, SessionBackend};
    use crate::store::Store;
    use chrono::{TimeZone, Utc};

    use super::*;

    fn kill(fp: &str, payload: &str, name: Option<&str>, minute: i64) -> EventCandidate {
        EventCandidate {
            source_id: None,
            server: "1".into(),
            at: Utc.with_ymd_and_hms(2025, 3, 2, 20, 0, 0).unwrap() + chrono::Duration::minutes(minute),
            raw_type: "KILL".into(),
            actor: Some(PlayerRef { id: "p1".into(), name: name.map(String::from) }),
            kind: EventKind::Kill {
                victim: Some(PlayerRef { id: "p2".into(), name: None }),
                weapon: Some("MP40".into()),
            },
            content: None,
            raw: None,
            fingerprint: fp.into(),
            payload_hash: payload.into(),
        }
    }

    fn new_game(tx: &mut BatchTx<'_>) -> String {
        let start = Utc.with_ymd_and_hms(2025, 3, 2, 20, 0, 0).unwrap().timestamp_millis();
        tx.create_game(&NewGame { server: "1".into(), start_ms: start, map: None, mode: None })
            .unwrap()
    }

    #[test]
    fn game_numbers_increase_per_server() {
        let mut store = Store::open_in_memory().unwrap();
        let mut tx = store.begin_batch().unwrap();
        assert_eq!(new_game(&mut tx), "1_1");
        assert_eq!(new_game(&mut tx), "1_2");
        tx.commit().unwrap();
    }

    #[test]
    fn replace_event_keeps_one_live_row() {
        let mut store = Store::open_in_memory().unwrap();
        let mut tx = store.begin_batch().unwrap();
        let key = new_game(&mut tx);
        let old = tx.insert_event(&kill("fp", "a", Some("Able"), 1), &key).unwrap();
        let new = tx.replace_event(old, &kill("fp", "b", Some("Able"), 1), &key).unwrap();
        let versions = tx.versions("fp").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions.iter().filter(|v| v.live).count(), 1);
        tx.commit().unwrap();

        let rows = store.events_by_fingerprint("fp").unwrap();
        assert_eq!(rows[0].superseded_by, Some(new));
        assert!(!rows[1].superseded);
        assert_eq!(store.players_in_game(&key).unwrap(), vec!["p1", "p2"]);
    }

    #[test]
    fn dropping_the_batch_rolls_back() {
        let mut store = Store::open_in_memory().unwrap();
        {
            let mut tx = store.begin_batch().unwrap();
            let key = new_game(&mut tx);
            tx.insert_event(&kill("fp", "a", None, 1), &key).unwrap();
        }
        assert!(store.games().unwrap().is_empty());
        assert_eq!(store.event_count(true).unwrap(), 0);
    }

    #[test]
    fn player_name_follows_newest_event() {
        let mut store = Store::open_in_memory().unwrap();
        let mut tx = store.begin_batch().unwrap();
        let key = new_game(&mut tx);
        tx.insert_event(&kill("a", "a", None, 1), &key).unwrap();
        tx.insert_event(&kill("b", "b", Some("Later"), 9), &key).unwrap();
        tx.insert_event(&kill("c", "c", Some("Earlier"), 5), &key).unwrap();
        tx.commit().unwrap();
        let p = store.player("p1").unwrap().unwrap();
        assert_eq!(p.current_name, "Later");
        assert_eq!(store.player_names("p1").unwrap(), vec!["Earlier", "Later"]);
        assert_eq!(store.player("p2").unwrap().unwrap().current_name, UNKNOWN_NAME);
    }

    #[test]
    fn closing_with_scores_sets_winner_and_duration() {
        let mut store = Store::open_in_memory().unwrap();
        let mut tx = store.begin_batch().unwrap();
        let key = new_game(&mut tx);
        let start = Utc.with_ymd_and_hms(2025, 3, 2, 20, 0, 0).unwrap().timestamp_millis();
        tx.close_game(
            &key,
            &Closure::Ended {
                end_ms: start + 90 * 60_000,
                map: Some("FOY".into()),
                allied_score: Some(2),
                axis_score: Some(3),
            },
        )
        .unwrap();
        tx.commit().unwrap();
        let g = store.game(&key).unwrap().unwrap();
        assert_eq!(g.duration_secs, Some(5400));
        assert_eq!(g.winner.as_deref(), Some("axis"));
        assert!(g.ended && !g.truncated);
        assert_eq!(g.map.as_deref(), Some("FOY"));
    }

    #[test]
    fn pending_hold_counts_attempts() {
        let mut store = Store::open_in_memory().unwrap();
        let mut tx = store.begin_batch().unwrap();
        let c = kill("fp", "a", None, 1);
        tx.hold_pending(&c).unwrap();
        tx.hold_pending(&c).unwrap();
        let pending = tx.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].candidate, c);
        assert!(tx.release_pending("fp", "a").unwrap());
        tx.commit().unwrap();
        assert!(store.pending_events().unwrap().is_empty());
    }
}
