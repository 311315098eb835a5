//! Pure metric computation over the live events of one closed game.

use std::collections::{BTreeMap, BTreeSet};

use super::PlayerAnalysis;
use crate::error::{IngestError, Result};
use crate::normalize::{sha256_hex, ActionKind};
use crate::store::{GameRecord, StoredEvent};

/// Version stamped on analyses when none is configured.
pub const CURRENT_VERSION: u32 = 2;

const UNKNOWN_WEAPON: &str = "unknown";

/// Registered presence rules. The discriminant is the stored version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicVersion {
    /// First connect (or game start) to the last disconnect after the last connect (or game end).
    Span = 1,
    /// Sum of connect -> disconnect intervals.
    Sessions = 2,
}

impl LogicVersion {
    pub fn from_number(v: u32) -> Result<Self> {
        match v {
            1 => Ok(LogicVersion::Span),
            2 => Ok(LogicVersion::Sessions),
            other => Err(IngestError::UnknownVersion(other)),
        }
    }

    pub fn number(self) -> u32 {
        self as u32
    }
}

/// Part of the game a player can be credited with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start_ms: i64,
    pub end_ms: i64,
    /// `start_ms` plus warmup, never past `end_ms`.
    pub counted_from_ms: i64,
}

impl Window {
    pub fn new(start_ms: i64, end_ms: i64, warmup_ms: i64) -> Self {
        let end_ms = end_ms.max(start_ms);
        Self {
            start_ms,
            end_ms,
            counted_from_ms: (start_ms + warmup_ms.max(0)).min(end_ms),
        }
    }

    fn overlap_ms(&self, from: i64, to: i64) -> i64 {
        (to.min(self.end_ms) - from.max(self.counted_from_ms)).max(0)
    }
}

/// Seconds a player counts as present, from their time-ordered `(ts, connected)` marks.
pub fn seconds_played(version: LogicVersion, window: &Window, marks: &[(i64, bool)]) -> f64 {
    if marks.is_empty() {
        return window.overlap_ms(window.start_ms, window.end_ms) as f64 / 1000.0;
    }
    let ms = match version {
        LogicVersion::Span => {
            let from = match marks.first() {
                Some(&(ts, true)) => ts,
                _ => window.start_ms,
            };
            let to = match marks.last() {
                Some(&(ts, false)) => ts,
                _ => window.end_ms,
            };
            window.overlap_ms(from, to)
        }
        LogicVersion::Sessions => {
            let mut total = 0;
            let mut open: Option<i64> = None;
            for (i, &(ts, connected)) in marks.iter().enumerate() {
                if connected {
                    open.get_or_insert(ts);
                    continue;
                }
                let from = match open.take() {
                    Some(since) => since,
                    None if i == 0 => window.start_ms,
                    None => continue,
                };
                total += window.overlap_ms(from, ts);
            }
            if let Some(since) = open {
                total += window.overlap_ms(since, window.end_ms);
            }
            total
        }
    };
    ms as f64 / 1000.0
}

/// Digest of everything an analysis depends on. Equal digests mean equal rows.
pub fn input_digest(game: &GameRecord, end_ms: i64, events: &[StoredEvent], version: u32, warmup_ms: i64) -> String {
    let mut parts: Vec<String> = vec![
        format!("v{}", version),
        game.game_key.clone(),
        game.start_ms.to_string(),
        end_ms.to_string(),
        warmup_ms.to_string(),
        game.truncated.to_string(),
    ];
    for e in events.iter().filter(|e| !e.superseded) {
        parts.push(format!("{}:{}", e.fingerprint, e.payload_hash));
    }
    let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    sha256_hex(&refs)
}

#[derive(Default)]
struct Tally {
    kills: u32,
    deaths: u32,
    team_kills: u32,
    team_deaths: u32,
    weapon_kills: BTreeMap<String, u32>,
    weapon_deaths: BTreeMap<String, u32>,
    victims: BTreeMap<String, u32>,
    nemeses: BTreeMap<String, u32>,
    kill_distribution: BTreeMap<i64, Vec<String>>,
    death_distribution: BTreeMap<i64, Vec<String>>,
    team_kill_distribution: BTreeMap<i64, Vec<String>>,
    team_death_distribution: BTreeMap<i64, Vec<String>>,
    marks: Vec<(i64, bool)>,
}

fn bump(map: &mut BTreeMap<String, u32>, key: &str) {
    *map.entry(key.to_string()).or_insert(0) += 1;
}

fn place(map: &mut BTreeMap<i64, Vec<String>>, offset: i64, other: Option<&str>) {
    if let Some(id) = other {
        map.entry(offset).or_default().push(id.to_string());
    }
}

/// Per-player analyses of one closed game, ordered by player id.
pub fn analyze_game(
    game: &GameRecord,
    end_ms: i64,
    events: &[StoredEvent],
    version: LogicVersion,
    warmup_ms: i64,
) -> Vec<PlayerAnalysis> {
    let window = Window::new(game.start_ms, end_ms, warmup_ms);
    let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
    let mut ordered: Vec<&StoredEvent> = events.iter().filter(|e| !e.superseded).collect();
    ordered.sort_by_key(|e| (e.event_ms, e.event_id));

    let players: BTreeSet<&str> = ordered
        .iter()
        .flat_map(|e| [e.actor_id.as_deref(), e.target_id.as_deref()])
        .flatten()
        .collect();
    for p in &players {
        tallies.insert((*p).to_string(), Tally::default());
    }

    for e in ordered {
        let actor = e.actor_id.as_deref();
        let target = e.target_id.as_deref();
        let weapon = e.weapon.as_deref().unwrap_or(UNKNOWN_WEAPON);
        let offset = (e.event_ms - game.start_ms).div_euclid(1000);
        match e.kind {
            ActionKind::Kill => {
                if let Some(t) = actor.and_then(|a| tallies.get_mut(a)) {
                    t.kills += 1;
                    bump(&mut t.weapon_kills, weapon);
                    if let Some(victim) = target {
                        bump(&mut t.victims, victim);
                    }
                    place(&mut t.kill_distribution, offset, target);
                }
                if let Some(t) = target.and_then(|v| tallies.get_mut(v)) {
                    t.deaths += 1;
                    bump(&mut t.weapon_deaths, weapon);
                    if let Some(killer) = actor {
                        bump(&mut t.nemeses, killer);
                    }
                    place(&mut t.death_distribution, offset, actor);
                }
            }
            ActionKind::TeamKill => {
                if let Some(t) = actor.and_then(|a| tallies.get_mut(a)) {
                    t.team_kills += 1;
                    place(&mut t.team_kill_distribution, offset, target);
                }
                if let Some(t) = target.and_then(|v| tallies.get_mut(v)) {
                    t.team_deaths += 1;
                    place(&mut t.team_death_distribution, offset, actor);
                }
            }
            ActionKind::Connect | ActionKind::Disconnect => {
                if let Some(t) = actor.and_then(|a| tallies.get_mut(a)) {
                    t.marks.push((e.event_ms, e.kind == ActionKind::Connect));
                }
            }
            _ => {}
        }
    }

    tallies
        .into_iter()
        .map(|(player_id, t)| {
            let seconds = seconds_played(version, &window, &t.marks);
            let minutes = seconds / 60.0;
            let per_minute = |n: u32| if minutes > 0.0 { n as f64 / minutes } else { 0.0 };
            PlayerAnalysis {
                game_key: game.game_key.clone(),
                player_id,
                version: version.number(),
                kills: t.kills,
                deaths: t.deaths,
                team_kills: t.team_kills,
                team_deaths: t.team_deaths,
                seconds_played: seconds,
                kpm: per_minute(t.kills),
                dpm: per_minute(t.deaths),
                ratio: if t.deaths > 0 { t.kills as f64 / t.deaths as f64 } else { t.kills as f64 },
                truncated: game.truncated,
                weapon_kills: t.weapon_kills,
                weapon_deaths: t.weapon_deaths,
                victims: t.victims,
                nemeses: t.nemeses,
                kill_distribution: t.kill_distribution,
                death_distribution: t.death_distribution,
                team_kill_distribution: t.team_kill_distribution,
                team_death_distribution: t.team_death_distribution,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn window() -> Window {
        Window::new(0, 60 * MIN, 0)
    }

    #[test]
    fn unknown_version_is_rejected() {
        assert_eq!(LogicVersion::from_number(2).unwrap(), LogicVersion::Sessions);
        assert!(matches!(
            LogicVersion::from_number(9),
            Err(IngestError::UnknownVersion(9))
        ));
    }

    #[test]
    fn no_marks_means_whole_game() {
        assert_eq!(seconds_played(LogicVersion::Sessions, &window(), &[]), 3600.0);
        assert_eq!(seconds_played(LogicVersion::Span, &window(), &[]), 3600.0);
    }

    #[test]
    fn sessions_skip_reconnect_gaps_but_span_does_not() {
        let marks = [(10 * MIN, true), (20 * MIN, false), (30 * MIN, true), (40 * MIN, false)];
        assert_eq!(seconds_played(LogicVersion::Sessions, &window(), &marks), 1200.0);
        assert_eq!(seconds_played(LogicVersion::Span, &window(), &marks), 1800.0);
    }

    #[test]
    fn leading_disconnect_and_trailing_connect_extend_to_bounds() {
        let marks = [(5 * MIN, false), (50 * MIN, true)];
        assert_eq!(seconds_played(LogicVersion::Sessions, &window(), &marks), 900.0);
    }

    #[test]
    fn warmup_is_not_counted() {
        let w = Window::new(0, 60 * MIN, 5 * MIN);
        assert_eq!(seconds_played(LogicVersion::Sessions, &w, &[]), 3300.0);
        assert_eq!(seconds_played(LogicVersion::Sessions, &w, &[(2 * MIN, true), (4 * MIN, false)]), 0.0);
        let tiny = Window::new(0, MIN, 5 * MIN);
        assert_eq!(tiny.counted_from_ms, MIN);
    }
}
