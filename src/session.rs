//! Per-server game session state machine.
//!
//! Each server stream is either idle or has exactly one open game. Transitions are driven by
//! start/end markers, the stale timeout and ordinary events; every transition is written
//! through a [`SessionBackend`] so the open game survives restarts.

use std::collections::HashMap;

use crate::error::Result;
use crate::logging::{log_game_closed, log_game_opened, log_orphan};
use crate::normalize::{EventCandidate, EventKind};

#[derive(Debug, Clone, PartialEq)]
pub struct OpenGame {
    pub game_key: String,
    pub server: String,
    pub start_ms: i64,
    pub last_event_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    NoOpenGame,
    GameOpen(OpenGame),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewGame {
    pub server: String,
    pub start_ms: i64,
    pub map: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Closure {
    /// Explicit end marker.
    Ended {
        end_ms: i64,
        map: Option<String>,
        allied_score: Option<u32>,
        axis_score: Option<u32>,
    },
    /// No end marker: stale timeout or a new start marker.
    Truncated { end_ms: i64, reason: &'static str },
}

impl Closure {
    pub fn end_ms(&self) -> i64 {
        match self {
            Closure::Ended { end_ms, .. } | Closure::Truncated { end_ms, .. } => *end_ms,
        }
    }
}

/// Game lookups and writes the assigner needs. Implemented by the store's batch transaction.
pub trait SessionBackend {
    fn open_game(&mut self, server: &str) -> Result<Option<OpenGame>>;
    /// Most recent game of `server` whose interval contains `at_ms`, open games included.
    fn enclosing_game(&mut self, server: &str, at_ms: i64) -> Result<Option<String>>;
    fn open_games(&mut self) -> Result<Vec<OpenGame>>;
    fn create_game(&mut self, game: &NewGame) -> Result<String>;
    fn close_game(&mut self, game_key: &str, closure: &Closure) -> Result<()>;
    fn touch_game(&mut self, game_key: &str, at_ms: i64) -> Result<()>;
    fn mark_seeding(&mut self, game_key: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Game(String),
    Pending,
}

pub struct SessionAssigner {
    stale_ms: i64,
    seeding_marker: Option<String>,
    states: HashMap<String, SessionState>,
    created: Vec<OpenGame>,
    pub opened: Vec<String>,
    pub closed: Vec<String>,
}

impl SessionAssigner {
    pub fn new(stale_ms: i64, seeding_marker: &str) -> Self {
        let marker = seeding_marker.trim();
        Self {
            stale_ms: stale_ms.max(0),
            seeding_marker: (!marker.is_empty()).then(|| marker.to_uppercase()),
            states: HashMap::new(),
            created: Vec::new(),
            opened: Vec::new(),
            closed: Vec::new(),
        }
    }

    /// Current state of a server stream, loaded from the backend on first use.
    pub fn state<B: SessionBackend + ?Sized>(&mut self, backend: &mut B, server: &str) -> Result<SessionState> {
        if let Some(state) = self.states.get(server) {
            return Ok(state.clone());
        }
        let state = match backend.open_game(server)? {
            Some(game) => SessionState::GameOpen(game),
            None => SessionState::NoOpenGame,
        };
        self.states.insert(server.to_string(), state.clone());
        Ok(state)
    }

    /// Place a new event. Callers feed events in `(timestamp, submission order)`.
    pub fn assign<B: SessionBackend + ?Sized>(&mut self, backend: &mut B, cand: &EventCandidate) -> Result<Placement> {
        let server = cand.server.as_str();
        let at = cand.at_ms();

        let state = match self.state(backend, server)? {
            SessionState::GameOpen(game) if at - game.last_event_ms > self.stale_ms => {
                self.close(backend, &game, Closure::Truncated { end_ms: game.last_event_ms, reason: "stale" })?;
                SessionState::NoOpenGame
            }
            other => other,
        };

        let placement = match (&cand.kind, state) {
            (EventKind::SessionStart { map, mode }, state) => {
                if let SessionState::GameOpen(game) = state {
                    self.close(
                        backend,
                        &game,
                        Closure::Truncated { end_ms: game.last_event_ms, reason: "restarted" },
                    )?;
                }
                let new = NewGame {
                    server: server.to_string(),
                    start_ms: at,
                    map: map.clone(),
                    mode: mode.clone(),
                };
                let key = backend.create_game(&new)?;
                log_game_opened(&key, server, at, new.map.as_deref());
                let game = OpenGame {
                    game_key: key.clone(),
                    server: server.to_string(),
                    start_ms: at,
                    last_event_ms: at,
                };
                self.opened.push(key.clone());
                self.created.push(game.clone());
                self.states.insert(server.to_string(), SessionState::GameOpen(game));
                Placement::Game(key)
            }
            (EventKind::SessionEnd { map, allied_score, axis_score }, SessionState::GameOpen(game))
                if game.start_ms <= at =>
            {
                backend.touch_game(&game.game_key, at)?;
                let closure = Closure::Ended {
                    end_ms: at,
                    map: map.clone(),
                    allied_score: *allied_score,
                    axis_score: *axis_score,
                };
                self.close(backend, &game, closure)?;
                Placement::Game(game.game_key)
            }
            (EventKind::SessionEnd { .. }, _) => self.enclosing(backend, server, at)?,
            (_, SessionState::GameOpen(game)) => {
                if at >= game.start_ms {
                    backend.touch_game(&game.game_key, at)?;
                    self.bump(server, at);
                    Placement::Game(game.game_key)
                } else {
                    match backend.enclosing_game(server, at)? {
                        Some(key) => Placement::Game(key),
                        None => Placement::Game(game.game_key),
                    }
                }
            }
            (_, SessionState::NoOpenGame) => self.enclosing(backend, server, at)?,
        };

        if let Placement::Game(key) = &placement {
            self.check_seeding(backend, key, cand)?;
        } else {
            log_orphan(&cand.fingerprint, server, at);
        }
        Ok(placement)
    }

    /// Second chance for an orphan once the rest of the batch has been placed: the enclosing
    /// game, else the first game created by this assigner that started after the event and
    /// within the stale timeout of it.
    pub fn retry_orphan<B: SessionBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        cand: &EventCandidate,
    ) -> Result<Placement> {
        let server = cand.server.as_str();
        let at = cand.at_ms();
        let key = match backend.enclosing_game(server, at)? {
            Some(key) => Some(key),
            None => self
                .created
                .iter()
                .filter(|g| g.server == server && g.start_ms >= at && g.start_ms - at <= self.stale_ms)
                .min_by_key(|g| g.start_ms)
                .map(|g| g.game_key.clone()),
        };
        match key {
            Some(key) => {
                self.check_seeding(backend, &key, cand)?;
                Ok(Placement::Game(key))
            }
            None => Ok(Placement::Pending),
        }
    }

    /// Close every open game whose last event is older than `now_ms` minus the stale timeout.
    pub fn sweep<B: SessionBackend + ?Sized>(&mut self, backend: &mut B, now_ms: i64) -> Result<usize> {
        let mut closed = 0;
        for game in backend.open_games()? {
            if now_ms - game.last_event_ms > self.stale_ms {
                self.close(backend, &game, Closure::Truncated { end_ms: game.last_event_ms, reason: "stale" })?;
                closed += 1;
            }
        }
        Ok(closed)
    }

    fn enclosing<B: SessionBackend + ?Sized>(&mut self, backend: &mut B, server: &str, at: i64) -> Result<Placement> {
        Ok(match backend.enclosing_game(server, at)? {
            Some(key) => Placement::Game(key),
            None => Placement::Pending,
        })
    }

    fn close<B: SessionBackend + ?Sized>(&mut self, backend: &mut B, game: &OpenGame, closure: Closure) -> Result<()> {
        backend.close_game(&game.game_key, &closure)?;
        let (truncated, reason) = match &closure {
            Closure::Ended { .. } => (false, "end_marker"),
            Closure::Truncated { reason, .. } => (true, *reason),
        };
        log_game_closed(&game.game_key, closure.end_ms(), truncated, reason);
        self.closed.push(game.game_key.clone());
        self.states.insert(game.server.clone(), SessionState::NoOpenGame);
        Ok(())
    }

    fn bump(&mut self, server: &str, at: i64) {
        if let Some(SessionState::GameOpen(game)) = self.states.get_mut(server) {
            game.last_event_ms = game.last_event_ms.max(at);
        }
    }

    fn check_seeding<B: SessionBackend + ?Sized>(
        &self,
        backend: &mut B,
        game_key: &str,
        cand: &EventCandidate,
    ) -> Result<()> {
        let Some(marker) = &self.seeding_marker else {
            return Ok(());
        };
        let text = match &cand.kind {
            EventKind::ServerMessage { message } | EventKind::Chat { message, .. } => Some(message.as_str()),
            _ => cand.content.as_deref(),
        };
        if text.map_or(false, |t| t.to_uppercase().contains(marker.as_str())) {
            backend.mark_seeding(game_key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::PlayerRef;
    use chrono::{TimeZone, Utc};

    #[derive(Debug, Clone)]
    struct Game {
        key: String,
        server: String,
        start: i64,
        end: Option<i64>,
        last: i64,
        truncated: bool,
        ended: bool,
        seeding: bool,
    }

    #[derive(Default)]
    struct MemBackend {
        games: Vec<Game>,
    }

    impl MemBackend {
        fn get(&self, key: &str) -> &Game {
            self.games.iter().find(|g| g.key == key).unwrap()
        }
    }

    impl SessionBackend for MemBackend {
        fn open_game(&mut self, server: &str) -> Result<Option<OpenGame>> {
            Ok(self.games.iter().find(|g| g.server == server && g.end.is_none()).map(|g| OpenGame {
                game_key: g.key.clone(),
                server: g.server.clone(),
                start_ms: g.start,
                last_event_ms: g.last,
            }))
        }

        fn enclosing_game(&mut self, server: &str, at_ms: i64) -> Result<Option<String>> {
            Ok(self
                .games
                .iter()
                .filter(|g| g.server == server && g.start <= at_ms && g.end.map_or(true, |e| e >= at_ms))
                .max_by_key(|g| g.start)
                .map(|g| g.key.clone()))
        }

        fn open_games(&mut self) -> Result<Vec<OpenGame>> {
            Ok(self
                .games
                .iter()
                .filter(|g| g.end.is_none())
                .map(|g| OpenGame {
                    game_key: g.key.clone(),
                    server: g.server.clone(),
                    start_ms: g.start,
                    last_event_ms: g.last,
                })
                .collect())
        }

        fn create_game(&mut self, game: &NewGame) -> Result<String> {
            let n = self.games.iter().filter(|g| g.server == game.server).count() + 1;
            let key = format!("{}_{}", game.server, n);
            self.games.push(Game {
                key: key.clone(),
                server: game.server.clone(),
                start: game.start_ms,
                end: None,
                last: game.start_ms,
                truncated: false,
                ended: false,
                seeding: false,
            });
            Ok(key)
        }

        fn close_game(&mut self, game_key: &str, closure: &Closure) -> Result<()> {
            let g = self.games.iter_mut().find(|g| g.key == game_key).unwrap();
            g.end = Some(closure.end_ms());
            match closure {
                Closure::Ended { .. } => g.ended = true,
                Closure::Truncated { .. } => g.truncated = true,
            }
            Ok(())
        }

        fn touch_game(&mut self, game_key: &str, at_ms: i64) -> Result<()> {
            let g = self.games.iter_mut().find(|g| g.key == game_key).unwrap();
            g.last = g.last.max(at_ms);
            Ok(())
        }

        fn mark_seeding(&mut self, game_key: &str) -> Result<()> {
            self.games.iter_mut().find(|g| g.key == game_key).unwrap().seeding = true;
            Ok(())
        }
    }

    const MIN: i64 = 60_000;

    fn event(kind: EventKind, minute: i64) -> EventCandidate {
        let at = Utc.with_ymd_and_hms(2025, 3, 2, 20, 0, 0).unwrap() + chrono::Duration::minutes(minute);
        EventCandidate {
            source_id: None,
            server: "1".into(),
            at,
            raw_type: "X".into(),
            actor: Some(PlayerRef { id: "p1".into(), name: None }),
            kind,
            content: None,
            raw: None,
            fingerprint: format!("fp-{}", minute),
            payload_hash: "x".into(),
        }
    }

    fn start(minute: i64) -> EventCandidate {
        event(EventKind::SessionStart { map: Some("FOY".into()), mode: None }, minute)
    }

    fn end(minute: i64) -> EventCandidate {
        event(
            EventKind::SessionEnd { map: None, allied_score: Some(4), axis_score: Some(1) },
            minute,
        )
    }

    fn connect(minute: i64) -> EventCandidate {
        event(EventKind::Connect, minute)
    }

    #[test]
    fn start_events_end_form_one_game() {
        let mut b = MemBackend::default();
        let mut a = SessionAssigner::new(120 * MIN, "THANK YOU FOR SEEDING");
        let key = match a.assign(&mut b, &start(0)).unwrap() {
            Placement::Game(k) => k,
            Placement::Pending => panic!("start marker must open a game"),
        };
        assert_eq!(key, "1_1");
        for m in 1..=10 {
            assert_eq!(a.assign(&mut b, &connect(m)).unwrap(), Placement::Game(key.clone()));
        }
        assert_eq!(a.assign(&mut b, &end(90)).unwrap(), Placement::Game(key.clone()));
        let g = b.get(&key);
        assert!(g.ended);
        assert!(!g.truncated);
        assert_eq!(g.end, Some(g.start + 90 * MIN));
        assert_eq!(a.state(&mut b, "1").unwrap(), SessionState::NoOpenGame);
    }

    #[test]
    fn event_before_any_game_is_pending_then_retried() {
        let mut b = MemBackend::default();
        let mut a = SessionAssigner::new(120 * MIN, "");
        let early = connect(0);
        assert_eq!(a.assign(&mut b, &early).unwrap(), Placement::Pending);
        a.assign(&mut b, &start(5)).unwrap();
        assert_eq!(a.retry_orphan(&mut b, &early).unwrap(), Placement::Game("1_1".into()));
    }

    #[test]
    fn second_start_truncates_the_open_game() {
        let mut b = MemBackend::default();
        let mut a = SessionAssigner::new(120 * MIN, "");
        a.assign(&mut b, &start(0)).unwrap();
        a.assign(&mut b, &connect(3)).unwrap();
        a.assign(&mut b, &start(10)).unwrap();
        let first = b.get("1_1");
        assert!(first.truncated);
        assert_eq!(first.end, Some(first.start + 3 * MIN));
        assert!(b.get("1_2").end.is_none());
        assert_eq!(a.opened, vec!["1_1".to_string(), "1_2".to_string()]);
        assert_eq!(a.closed, vec!["1_1".to_string()]);
    }

    #[test]
    fn stale_gap_closes_game_at_last_event() {
        let mut b = MemBackend::default();
        let mut a = SessionAssigner::new(120 * MIN, "");
        a.assign(&mut b, &start(0)).unwrap();
        a.assign(&mut b, &connect(30)).unwrap();
        assert_eq!(a.assign(&mut b, &connect(30 + 121)).unwrap(), Placement::Pending);
        let g = b.get("1_1");
        assert!(g.truncated);
        assert_eq!(g.end, Some(g.start + 30 * MIN));
    }

    #[test]
    fn sweep_closes_idle_games() {
        let mut b = MemBackend::default();
        let mut a = SessionAssigner::new(120 * MIN, "");
        a.assign(&mut b, &start(0)).unwrap();
        let base = b.get("1_1").start;
        assert_eq!(a.sweep(&mut b, base + 60 * MIN).unwrap(), 0);
        assert_eq!(a.sweep(&mut b, base + 121 * MIN).unwrap(), 1);
        assert!(b.get("1_1").truncated);
    }

    #[test]
    fn late_event_joins_the_closed_game_that_contains_it() {
        let mut b = MemBackend::default();
        let mut a = SessionAssigner::new(120 * MIN, "");
        a.assign(&mut b, &start(0)).unwrap();
        a.assign(&mut b, &end(60)).unwrap();
        a.assign(&mut b, &start(70)).unwrap();
        assert_eq!(a.assign(&mut b, &connect(30)).unwrap(), Placement::Game("1_1".into()));
    }

    #[test]
    fn seeding_message_flags_the_game() {
        let mut b = MemBackend::default();
        let mut a = SessionAssigner::new(120 * MIN, "THANK YOU FOR SEEDING");
        a.assign(&mut b, &start(0)).unwrap();
        let msg = event(
            EventKind::ServerMessage { message: "Thank you for seeding, see you soon".into() },
            2,
        );
        a.assign(&mut b, &msg).unwrap();
        assert!(b.get("1_1").seeding);
    }

    #[test]
    fn state_is_recovered_from_the_backend() {
        let mut b = MemBackend::default();
        SessionAssigner::new(120 * MIN, "").assign(&mut b, &start(0)).unwrap();
        let mut fresh = SessionAssigner::new(120 * MIN, "");
        assert_eq!(fresh.assign(&mut b, &connect(5)).unwrap(), Placement::Game("1_1".into()));
    }
}
