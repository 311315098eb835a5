//! Where raw log records come from: a folder of downloaded JSON files or the stats API.

mod http;
pub mod retry;

pub use http::HttpLogSource;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::normalize::{parse_timestamp, RawRecord};

/// Half-open time range `[from, till)` of records to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub from: DateTime<Utc>,
    pub till: DateTime<Utc>,
}

impl FetchWindow {
    pub fn new(from: DateTime<Utc>, till: DateTime<Utc>) -> Self {
        Self { from, till }
    }

    /// Consecutive windows of at most `span` covering this one.
    pub fn split(&self, span: Duration) -> Vec<FetchWindow> {
        let mut out = Vec::new();
        if span <= Duration::zero() {
            out.push(*self);
            return out;
        }
        let mut from = self.from;
        while from < self.till {
            let till = (from + span).min(self.till);
            out.push(FetchWindow { from, till });
            from = till;
        }
        out
    }

    fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at < self.till
    }
}

#[async_trait]
pub trait LogSource {
    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<RawRecord>>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Records(Vec<RawRecord>),
    Wrapped { result: Vec<RawRecord> },
}

/// Records of one JSON document: a bare array or the API's `{"result": [...]}` envelope.
pub fn parse_records(text: &str) -> Result<Vec<RawRecord>> {
    let payload: Payload = serde_json::from_str(text).context("log file is neither an array nor {\"result\": [...]}")?;
    Ok(match payload {
        Payload::Records(r) => r,
        Payload::Wrapped { result } => result,
    })
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// A folder of `*.json` downloads, read in file name order.
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))? {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |e| e == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn read_file(path: &Path) -> Result<Vec<RawRecord>> {
        let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        parse_records(&text).with_context(|| format!("parse {}", path.display()))
    }

    /// Write a downloaded window as `<from>.json` (colons replaced), records sorted by time.
    pub fn save(&self, window: &FetchWindow, mut records: Vec<RawRecord>) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        records.sort_by_key(|r| {
            r.event_time
                .as_ref()
                .and_then(|t| parse_timestamp(t).ok())
                .map(|t| t.timestamp_millis())
        });
        let name = window.from.format("%Y-%m-%dT%H-%M-%S").to_string();
        let path = self.dir.join(format!("{}.json", name));
        std::fs::write(&path, serde_json::to_string_pretty(&records)?)?;
        Ok(path)
    }

    /// Start of the next download: the newest event time in the newest file.
    pub fn last_event_time(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(last) = self.files()?.pop() else {
            return Ok(None);
        };
        Ok(Self::read_file(&last)?
            .iter()
            .filter_map(|r| r.event_time.as_ref().and_then(|t| parse_timestamp(t).ok()))
            .max())
    }
}

#[async_trait]
impl LogSource for DirectorySource {
    /// Records of every file whose timestamp falls in the window. Records without a readable
    /// timestamp are passed through so normalization can report them.
    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<RawRecord>> {
        let mut out = Vec::new();
        for path in self.files()? {
            for rec in Self::read_file(&path)? {
                let at = rec.event_time.as_ref().and_then(|t| parse_timestamp(t).ok());
                if at.map_or(true, |at| window.contains(at)) {
                    out.push(rec);
                }
            }
        }
        Ok(out)
    }
}
