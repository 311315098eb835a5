use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};

use killfeed::config::Config;
use killfeed::derive::DerivationEngine;
use killfeed::error::IngestError;
use killfeed::normalize::RawRecord;
use killfeed::{Pipeline, Store};

fn at(secs: i64) -> String {
    let base = Utc.with_ymd_and_hms(2025, 3, 2, 20, 0, 0).unwrap();
    (base + Duration::seconds(secs)).format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn raw(v: Value) -> RawRecord {
    serde_json::from_value(v).unwrap()
}

fn start(secs: i64) -> RawRecord {
    raw(json!({
        "type": "MATCH START", "event_time": at(secs), "server": "1",
        "content": "MATCH START FOY Warfare"
    }))
}

fn end(secs: i64) -> RawRecord {
    raw(json!({
        "type": "MATCH ENDED", "event_time": at(secs), "server": "1",
        "content": "MATCH ENDED `FOY Warfare` ALLIED (3 - 2) AXIS"
    }))
}

fn kill(secs: i64, killer: &str, victim: &str) -> RawRecord {
    raw(json!({
        "type": "KILL", "event_time": at(secs), "server": "1",
        "player1_id": killer, "player1_name": killer,
        "player2_id": victim, "player2_name": victim,
        "weapon": "MP40"
    }))
}

fn presence(secs: i64, player: &str, kind: &str) -> RawRecord {
    raw(json!({
        "type": kind, "event_time": at(secs), "server": "1",
        "player1_id": player, "player1_name": player
    }))
}

/// Three minute game: p1 kills p2 six times, p3 kills p1 twice.
fn three_minute_game() -> Vec<RawRecord> {
    let mut batch = vec![start(0)];
    for i in 1..=6 {
        batch.push(kill(i * 10, "p1", "p2"));
    }
    batch.push(kill(70, "p3", "p1"));
    batch.push(kill(80, "p3", "p1"));
    batch.push(end(180));
    batch
}

fn ingested(batch: &[RawRecord]) -> Pipeline {
    let mut p = Pipeline::new(Config::default(), Store::open_in_memory().unwrap()).unwrap();
    p.ingest_batch(batch).unwrap();
    p
}

#[test]
fn rates_are_per_minute_of_presence() {
    let p = ingested(&three_minute_game());
    let rows = p.store().analyses_for_game("1_1", 2).unwrap();
    assert_eq!(rows.len(), 3);

    let p1 = rows.iter().find(|r| r.player_id == "p1").unwrap();
    assert_eq!(p1.kills, 6);
    assert_eq!(p1.deaths, 2);
    assert_eq!(p1.seconds_played, 180.0);
    assert!((p1.kpm - 2.0).abs() < 1e-9);
    assert!((p1.dpm - 2.0 / 3.0).abs() < 1e-9);
    assert!((p1.ratio - 3.0).abs() < 1e-9);
    assert_eq!(p1.victims.get("p2"), Some(&6));
    assert_eq!(p1.nemeses.get("p3"), Some(&2));

    let p3 = rows.iter().find(|r| r.player_id == "p3").unwrap();
    assert_eq!(p3.deaths, 0);
    assert_eq!(p3.ratio, 2.0);
}

#[test]
fn distributions_key_kills_and_deaths_by_offset() {
    let mut batch = three_minute_game();
    batch.insert(
        batch.len() - 1,
        raw(json!({
            "type": "TEAM KILL", "event_time": at(95), "server": "1",
            "player1_id": "p2", "player1_name": "p2",
            "player2_id": "p1", "player2_name": "p1",
            "weapon": "MP40"
        })),
    );
    let p = ingested(&batch);
    let rows = p.store().analyses_for_game("1_1", 2).unwrap();

    let p1 = rows.iter().find(|r| r.player_id == "p1").unwrap();
    let offsets: Vec<i64> = p1.kill_distribution.keys().copied().collect();
    assert_eq!(offsets, vec![10, 20, 30, 40, 50, 60]);
    assert!(p1.kill_distribution.values().all(|v| v == &vec!["p2".to_string()]));
    assert_eq!(p1.death_distribution.get(&70), Some(&vec!["p3".to_string()]));
    assert_eq!(p1.death_distribution.get(&80), Some(&vec!["p3".to_string()]));
    assert_eq!(p1.death_distribution.len(), 2);
    assert_eq!(p1.team_death_distribution.get(&95), Some(&vec!["p2".to_string()]));
    assert!(p1.team_kill_distribution.is_empty());

    let p2 = rows.iter().find(|r| r.player_id == "p2").unwrap();
    assert_eq!(p2.team_kills, 1);
    assert_eq!(p2.team_kill_distribution.get(&95), Some(&vec!["p1".to_string()]));
    assert_eq!(p2.death_distribution.len(), 6);

    let encoded = serde_json::to_value(p1).unwrap();
    assert_eq!(encoded["death_distribution"], json!({"70": ["p3"], "80": ["p3"]}));
}

#[test]
fn same_second_kills_share_an_offset() {
    let batch = vec![start(0), kill(30, "p1", "p2"), kill(30, "p1", "p3"), end(120)];
    let p = ingested(&batch);
    let rows = p.store().analyses_for_game("1_1", 2).unwrap();
    let p1 = rows.iter().find(|r| r.player_id == "p1").unwrap();
    assert_eq!(
        p1.kill_distribution.get(&30),
        Some(&vec!["p2".to_string(), "p3".to_string()])
    );
}

#[test]
fn zero_presence_gives_zero_rates() {
    let batch = vec![
        start(0),
        presence(100, "p4", "CONNECTED"),
        kill(100, "p4", "p2"),
        presence(100, "p4", "DISCONNECTED"),
        end(180),
    ];
    let p = ingested(&batch);
    let rows = p.store().analyses_for_game("1_1", 2).unwrap();
    let p4 = rows.iter().find(|r| r.player_id == "p4").unwrap();
    assert_eq!(p4.kills, 1);
    assert_eq!(p4.seconds_played, 0.0);
    assert_eq!(p4.kpm, 0.0);
    assert_eq!(p4.dpm, 0.0);
    assert!(p4.kpm.is_finite() && p4.ratio.is_finite());
}

#[test]
fn forced_recompute_is_stable() {
    let mut p = ingested(&three_minute_game());
    let engine = DerivationEngine::from_config(&Config::default()).unwrap();
    engine.derive_all(p.store_mut(), true).unwrap();
    let first = p.store().analyses_for_game("1_1", 2).unwrap();
    let first_digest = p.store().analysis_digest("1_1", 2).unwrap();

    let again = engine.derive_all(p.store_mut(), true).unwrap();
    assert_eq!(again.derived, vec!["1_1".to_string()]);
    assert_eq!(p.store().analyses_for_game("1_1", 2).unwrap(), first);
    assert_eq!(p.store().analysis_digest("1_1", 2).unwrap(), first_digest);
}

#[test]
fn unchanged_inputs_are_not_rewritten() {
    let mut p = ingested(&three_minute_game());
    let engine = DerivationEngine::from_config(&Config::default()).unwrap();
    let report = engine.derive_all(p.store_mut(), false).unwrap();
    assert!(report.derived.is_empty());
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.rows_written, 0);
}

#[test]
fn versions_coexist_until_purged() {
    let mut p = ingested(&three_minute_game());
    let v1 = DerivationEngine::new(1, 0).unwrap();
    let report = v1.derive_all(p.store_mut(), false).unwrap();
    assert_eq!(report.derived, vec!["1_1".to_string()]);

    let old = p.store().analyses_for_game("1_1", 1).unwrap();
    let new = p.store().analyses_for_game("1_1", 2).unwrap();
    assert_eq!(old.len(), 3);
    assert_eq!(new.len(), 3);
    assert!(old.iter().all(|r| r.version == 1));
    assert_eq!(p.store().latest_analysis_version("p1", "1_1").unwrap(), Some(2));

    let removed = p.store_mut().purge_older_than(2).unwrap();
    assert_eq!(removed, 3);
    assert!(p.store().analyses_for_game("1_1", 1).unwrap().is_empty());
    assert_eq!(p.store().analyses_for_game("1_1", 2).unwrap(), new);
}

#[test]
fn unregistered_version_is_an_error() {
    assert!(matches!(
        DerivationEngine::new(7, 0),
        Err(IngestError::UnknownVersion(7))
    ));
    let cfg = Config {
        derivation_version: 0,
        ..Config::default()
    };
    assert!(Pipeline::new(cfg, Store::open_in_memory().unwrap()).is_err());
}

#[test]
fn seeding_games_are_left_underived() {
    let batch = vec![
        start(0),
        raw(json!({
            "type": "MESSAGE", "event_time": at(5), "server": "1",
            "content": "Thank you for seeding! Rules are relaxed until 40 players."
        })),
        kill(20, "p1", "p2"),
        end(120),
    ];
    let mut p = Pipeline::new(Config::default(), Store::open_in_memory().unwrap()).unwrap();
    let report = p.ingest_batch(&batch).unwrap();
    assert!(p.store().game("1_1").unwrap().unwrap().seeding);
    assert!(report.derive.skipped_seeding > 0);
    assert!(p.store().analyses_for_game("1_1", 2).unwrap().is_empty());

    let engine = DerivationEngine::new(2, 0).unwrap().with_skip_seeding(false);
    engine.derive_all(p.store_mut(), false).unwrap();
    assert_eq!(p.store().analyses_for_game("1_1", 2).unwrap().len(), 2);
}

#[test]
fn truncated_games_flag_their_rows() {
    let p = ingested(&[start(0), kill(10, "p1", "p2"), start(100)]);
    let game = p.store().game("1_1").unwrap().unwrap();
    assert!(game.truncated);
    let rows = p.store().analyses_for_game("1_1", 2).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.truncated));
    assert_eq!(rows[0].seconds_played, 10.0);
    assert!(p.store().open_games().unwrap().iter().any(|g| g.game_key == "1_2"));
}

#[test]
fn outstanding_derivation_restores_purged_rows() {
    let mut p = ingested(&three_minute_game());
    let before = p.store().analyses_for_game("1_1", 2).unwrap();
    p.store_mut().purge_version(2).unwrap();
    assert_eq!(p.store().games_missing_analysis(2).unwrap(), vec!["1_1".to_string()]);

    let report = p.derive(false, false).unwrap();
    assert_eq!(report.derived, vec!["1_1".to_string()]);
    assert_eq!(p.store().analyses_for_game("1_1", 2).unwrap(), before);
}

#[test]
fn warmup_shortens_presence() {
    let cfg = Config {
        warmup_secs: 60,
        ..Config::default()
    };
    let mut p = Pipeline::new(cfg, Store::open_in_memory().unwrap()).unwrap();
    p.ingest_batch(&three_minute_game()).unwrap();
    let rows = p.store().analyses_for_game("1_1", 2).unwrap();
    let p1 = rows.iter().find(|r| r.player_id == "p1").unwrap();
    assert_eq!(p1.seconds_played, 120.0);
    assert!((p1.kpm - 3.0).abs() < 1e-9);
}
