//! Date series over stored analyses, shaped for a plotting consumer.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Kpm,
    Dpm,
    Kills,
    Deaths,
    Ratio,
    Minutes,
    TeamKills,
}

impl Metric {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "kpm" => Metric::Kpm,
            "dpm" => Metric::Dpm,
            "kills" => Metric::Kills,
            "deaths" => Metric::Deaths,
            "ratio" | "kd" => Metric::Ratio,
            "minutes" => Metric::Minutes,
            "team_kills" | "teamkills" => Metric::TeamKills,
            _ => return None,
        })
    }

    fn value(&self, row: &Row) -> f64 {
        match self {
            Metric::Kpm => row.kpm,
            Metric::Dpm => row.dpm,
            Metric::Kills => row.kills as f64,
            Metric::Deaths => row.deaths as f64,
            Metric::Ratio => row.ratio,
            Metric::Minutes => row.seconds / 60.0,
            Metric::TeamKills => row.team_kills as f64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeriesQuery {
    pub metric: Metric,
    /// Inclusive, by game start date (UTC).
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub players: Option<Vec<String>>,
    pub include_seeding: bool,
    /// Pin one derivation version; otherwise the latest per (player, game).
    pub version: Option<u32>,
    pub min_minutes: f64,
}

impl SeriesQuery {
    pub fn new(metric: Metric, from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            metric,
            from,
            to,
            players: None,
            include_seeding: false,
            version: None,
            min_minutes: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
    pub samples: usize,
}

struct Row {
    start_ms: i64,
    player_id: String,
    kills: u32,
    deaths: u32,
    team_kills: u32,
    seconds: f64,
    kpm: f64,
    dpm: f64,
    ratio: f64,
}

fn day_start_ms(d: NaiveDate) -> i64 {
    Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)).timestamp_millis()
}

/// Per-day average of the metric over every matching (player, game) analysis, ordered by date.
pub fn metric_series(store: &Store, q: &SeriesQuery) -> Result<Vec<SeriesPoint>> {
    let from_ms = day_start_ms(q.from);
    let to_ms = day_start_ms(q.to.succ_opt().unwrap_or(q.to));
    let sql = "SELECT g.start_ms, pa.player_id, pa.kills, pa.deaths, pa.team_kills, \
                      pa.seconds_played, pa.kpm, pa.dpm, pa.ratio \
               FROM player_analyses pa JOIN games g ON g.game_key = pa.game_key \
               WHERE g.start_ms >= ?1 AND g.start_ms < ?2 AND (?3 OR g.seeding = 0) \
                 AND pa.version = CASE WHEN ?4 IS NULL THEN \
                     (SELECT MAX(l.version) FROM player_analyses l \
                      WHERE l.game_key = pa.game_key AND l.player_id = pa.player_id) \
                   ELSE ?4 END \
               ORDER BY g.start_ms, pa.player_id";
    let mut stmt = store.conn().prepare(sql)?;
    let rows = stmt.query_map(params![from_ms, to_ms, q.include_seeding, q.version], |r| {
        Ok(Row {
            start_ms: r.get(0)?,
            player_id: r.get(1)?,
            kills: r.get(2)?,
            deaths: r.get(3)?,
            team_kills: r.get(4)?,
            seconds: r.get(5)?,
            kpm: r.get(6)?,
            dpm: r.get(7)?,
            ratio: r.get(8)?,
        })
    })?;

    let wanted: Option<HashSet<&str>> = q
        .players
        .as_ref()
        .map(|ps| ps.iter().map(String::as_str).collect());
    let mut days: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
    for row in rows {
        let row = row?;
        if wanted.as_ref().map_or(false, |w| !w.contains(row.player_id.as_str())) {
            continue;
        }
        if row.seconds / 60.0 < q.min_minutes {
            continue;
        }
        let Some(date) = Utc.timestamp_millis_opt(row.start_ms).single().map(|d| d.date_naive()) else {
            continue;
        };
        let slot = days.entry(date).or_insert((0.0, 0));
        slot.0 += q.metric.value(&row);
        slot.1 += 1;
    }

    Ok(days
        .into_iter()
        .map(|(date, (sum, n))| SeriesPoint {
            date,
            value: sum / n as f64,
            samples: n,
        })
        .collect())
}

/// Player ids of a group file: a JSON object mapping player id to known names.
pub fn load_group(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    let group: BTreeMap<String, Vec<String>> = serde_json::from_str(&text)?;
    Ok(group.into_keys().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::{GameAnalysis, PlayerAnalysis};
    use crate::session::{Closure, NewGame, SessionBackend};

    fn analysis(game: &str, player: &str, version: u32, kpm: f64) -> PlayerAnalysis {
        PlayerAnalysis {
            game_key: game.into(),
            player_id: player.into(),
            version,
            kills: 0,
            deaths: 0,
            team_kills: 0,
            team_deaths: 0,
            seconds_played: 600.0,
            kpm,
            dpm: 0.0,
            ratio: 0.0,
            truncated: false,
            weapon_kills: BTreeMap::new(),
            weapon_deaths: BTreeMap::new(),
            victims: BTreeMap::new(),
            nemeses: BTreeMap::new(),
            kill_distribution: BTreeMap::new(),
            death_distribution: BTreeMap::new(),
            team_kill_distribution: BTreeMap::new(),
            team_death_distribution: BTreeMap::new(),
        }
    }

    fn seed(store: &mut Store) {
        let day = |d: u32| Utc.with_ymd_and_hms(2025, 3, d, 20, 0, 0).unwrap().timestamp_millis();
        let mut tx = store.begin_batch().unwrap();
        for d in [1, 2] {
            let key = tx
                .create_game(&NewGame { server: "1".into(), start_ms: day(d), map: None, mode: None })
                .unwrap();
            tx.close_game(&key, &Closure::Truncated { end_ms: day(d) + 3_600_000, reason: "test" })
                .unwrap();
        }
        for p in ["a", "b"] {
            for g in ["1_1", "1_2"] {
                tx.insert_event(&player_event(p, g), g).unwrap();
            }
        }
        tx.commit().unwrap();

        let rows = |game: &str, version: u32, a: f64, b: f64| GameAnalysis {
            game_key: game.into(),
            version,
            input_digest: "d".into(),
            truncated: false,
            players: vec![analysis(game, "a", version, a), analysis(game, "b", version, b)],
        };
        store.replace_analysis(&rows("1_1", 1, 1.0, 3.0)).unwrap();
        store.replace_analysis(&rows("1_1", 2, 2.0, 4.0)).unwrap();
        store.replace_analysis(&rows("1_2", 2, 5.0, 5.0)).unwrap();
    }

    fn player_event(player: &str, game: &str) -> crate::normalize::EventCandidate {
        use crate::normalize::{EventCandidate, EventKind, PlayerRef};
        EventCandidate {
            source_id: None,
            server: "1".into(),
            at: Utc.with_ymd_and_hms(2025, 3, 1, 20, 1, 0).unwrap(),
            raw_type: "CONNECTED".into(),
            actor: Some(PlayerRef { id: player.into(), name: None }),
            kind: EventKind::Connect,
            content: None,
            raw: None,
            fingerprint: format!("{}-{}", player, game),
            payload_hash: "x".into(),
        }
    }

    fn range() -> (NaiveDate, NaiveDate) {
        (
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(),
        )
    }

    #[test]
    fn latest_version_is_averaged_per_day() {
        let mut store = Store::open_in_memory().unwrap();
        seed(&mut store);
        let (from, to) = range();
        let points = metric_series(&store, &SeriesQuery::new(Metric::Kpm, from, to)).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].date, from);
        assert_eq!(points[0].value, 3.0);
        assert_eq!(points[0].samples, 2);
        assert_eq!(points[1].value, 5.0);
    }

    #[test]
    fn pinned_version_and_player_group_filter() {
        let mut store = Store::open_in_memory().unwrap();
        seed(&mut store);
        let (from, to) = range();
        let mut q = SeriesQuery::new(Metric::Kpm, from, to);
        q.version = Some(1);
        q.players = Some(vec!["b".into()]);
        let points = metric_series(&store, &q).unwrap();
        assert_eq!(points, vec![SeriesPoint { date: from, value: 3.0, samples: 1 }]);
    }

    #[test]
    fn group_file_lists_player_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.json");
        std::fs::write(&path, r#"{"765": ["Able", "Able2"], "123": ["Baker"]}"#).unwrap();
        assert_eq!(load_group(&path).unwrap(), vec!["123", "765"]);
        assert_eq!(Metric::parse("KPM"), Some(Metric::Kpm));
        assert_eq!(Metric::parse("elo"), None);
    }
}
