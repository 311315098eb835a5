//! killfeed: game-server log ingestion and per-player metrics.
//!
//! Usage:
//!   killfeed <command> [options]
//!
//! Commands:
//!   ingest [dir]                      - Ingest every new *.json file (default: LOG_FOLDER)
//!   fetch --from=<t> [--till=<t>]     - Download windows from the API into LOG_FOLDER and ingest them
//!   run                               - ingest, then fetch from the newest stored log to now
//!   derive [--all] [--force]          - Derive analyses (default: games still missing rows)
//!   purge --version=<n> | --older-than=<n>
//!   series --metric=<m> --from=<date> --to=<date> [--players=a,b] [--group=<file>]
//!          [--version=<n>] [--seeding] [--min-minutes=<x>]
//!   pending                           - List events held without a game
//!
//! Configuration comes from the environment (see `Config::from_env`).

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;

use killfeed::config::Config;
use killfeed::logging::{log, obj, v_str, Domain, Level};
use killfeed::normalize::{parse_timestamp, RawTimestamp};
use killfeed::pipeline::Pipeline;
use killfeed::series::{load_group, metric_series, Metric, SeriesQuery};
use killfeed::source::{DirectorySource, FetchWindow, HttpLogSource};

fn print_usage() {
    eprintln!("usage: killfeed <ingest|fetch|run|derive|purge|series|pending> [options]");
}

/// `--key=value` lookup.
fn opt<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    let prefix = format!("--{}=", key);
    args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
}

fn has_flag(args: &[String], key: &str) -> bool {
    let flag = format!("--{}", key);
    args.iter().any(|a| *a == flag)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("bad date {}", s))?
            .and_utc());
    }
    parse_timestamp(&RawTimestamp::Text(s.to_string())).map_err(|e| anyhow!(e))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("bad date {:?}", s))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_fetch(pipeline: &mut Pipeline, from: DateTime<Utc>, till: DateTime<Utc>) -> Result<()> {
    let cfg = pipeline.config().clone();
    let source = HttpLogSource::from_config(&cfg)?;
    let folder = DirectorySource::new(&cfg.log_folder);
    let reports = pipeline
        .fetch_and_ingest(&source, FetchWindow::new(from, till), Some(&folder))
        .await?;
    print_json(&reports)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).cloned() else {
        print_usage();
        std::process::exit(1);
    };
    let rest = &args[2..];

    let cfg = Config::from_env();
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("command", v_str(&cmd)),
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("derivation_version", json!(cfg.derivation_version)),
        ]),
    );
    let mut pipeline = Pipeline::open(cfg.clone())?;

    match cmd.as_str() {
        "ingest" => {
            let dir = rest
                .iter()
                .find(|a| !a.starts_with("--"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(&cfg.log_folder));
            print_json(&pipeline.ingest_dir(&dir)?)?;
        }
        "fetch" => {
            let from = parse_time(opt(rest, "from").ok_or_else(|| anyhow!("fetch needs --from=<time>"))?)?;
            let till = match opt(rest, "till") {
                Some(t) => parse_time(t)?,
                None => Utc::now(),
            };
            cmd_fetch(&mut pipeline, from, till).await?;
        }
        "run" => {
            let folder = DirectorySource::new(&cfg.log_folder);
            std::fs::create_dir_all(&cfg.log_folder)?;
            print_json(&pipeline.ingest_dir(Path::new(&cfg.log_folder))?)?;
            let from = match opt(rest, "from") {
                Some(t) => parse_time(t)?,
                None => folder
                    .last_event_time()?
                    .ok_or_else(|| anyhow!("no local logs yet; pass --from=<time>"))?,
            };
            cmd_fetch(&mut pipeline, from, Utc::now()).await?;
        }
        "derive" => {
            let force = has_flag(rest, "force") || cfg.force_recompute;
            print_json(&pipeline.derive(has_flag(rest, "all"), force)?)?;
        }
        "purge" => {
            let store = pipeline.store_mut();
            let removed = if let Some(v) = opt(rest, "version") {
                store.purge_version(v.parse().context("--version")?)?
            } else if let Some(v) = opt(rest, "older-than") {
                store.purge_older_than(v.parse().context("--older-than")?)?
            } else {
                bail!("purge needs --version=<n> or --older-than=<n>");
            };
            print_json(&json!({ "rows_removed": removed }))?;
        }
        "series" => {
            let metric_name = opt(rest, "metric").unwrap_or("kpm");
            let metric = Metric::parse(metric_name).ok_or_else(|| anyhow!("unknown metric {}", metric_name))?;
            let from = parse_date(opt(rest, "from").ok_or_else(|| anyhow!("series needs --from=<date>"))?)?;
            let to = match opt(rest, "to") {
                Some(d) => parse_date(d)?,
                None => Utc::now().date_naive(),
            };
            let mut q = SeriesQuery::new(metric, from, to);
            q.include_seeding = has_flag(rest, "seeding");
            q.version = opt(rest, "version").map(str::parse).transpose().context("--version")?;
            q.min_minutes = opt(rest, "min-minutes").map(str::parse).transpose().context("--min-minutes")?.unwrap_or(0.0);
            if let Some(players) = opt(rest, "players") {
                q.players = Some(players.split(',').map(|p| p.trim().to_string()).collect());
            } else if let Some(group) = opt(rest, "group").map(String::from).or(cfg.group_file.clone()) {
                q.players = Some(load_group(Path::new(&group))?);
            }
            print_json(&metric_series(pipeline.store(), &q)?)?;
        }
        "pending" => {
            let pending: Vec<_> = pipeline
                .store()
                .pending_events()?
                .into_iter()
                .map(|p| {
                    json!({
                        "fingerprint": p.candidate.fingerprint,
                        "server": p.candidate.server,
                        "at": p.candidate.at.to_rfc3339(),
                        "type": p.candidate.raw_type,
                        "held_at": p.held_at,
                        "attempts": p.attempts,
                    })
                })
                .collect();
            print_json(&pending)?;
        }
        other => {
            eprintln!("unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    }
    Ok(())
}
