//! Raw log record -> canonical event candidate.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{Config, MarkerRules};
use crate::error::{IngestError, Result};

/// Servers that do not name themselves all land in one stream.
pub const DEFAULT_SERVER: &str = "default";

/// Epoch values at or above this are read as milliseconds.
const EPOCH_MS_THRESHOLD: i64 = 100_000_000_000;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Timestamp as it appears in the producer's JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(i64),
    EpochFloat(f64),
    Text(String),
}

/// One record as delivered by the log producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub event_time: Option<RawTimestamp>,
    #[serde(default)]
    pub creation_time: Option<RawTimestamp>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub player1_id: Option<String>,
    #[serde(default)]
    pub player1_name: Option<String>,
    #[serde(default)]
    pub player2_id: Option<String>,
    #[serde(default)]
    pub player2_name: Option<String>,
    #[serde(default)]
    pub weapon: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub server: Option<String>,
}

fn string_or_number<'de, D>(de: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Either {
        S(String),
        I(i64),
        F(f64),
    }
    Ok(match Option::<Either>::deserialize(de)? {
        Some(Either::S(s)) => Some(s),
        Some(Either::I(i)) => Some(i.to_string()),
        Some(Either::F(f)) => Some(f.to_string()),
        None => None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRef {
    pub id: String,
    pub name: Option<String>,
}

/// What happened, with the fields each kind of event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Kill {
        victim: Option<PlayerRef>,
        weapon: Option<String>,
    },
    TeamKill {
        victim: Option<PlayerRef>,
        weapon: Option<String>,
    },
    Connect,
    Disconnect,
    Chat {
        channel: String,
        message: String,
    },
    ServerMessage {
        message: String,
    },
    SessionStart {
        map: Option<String>,
        mode: Option<String>,
    },
    SessionEnd {
        map: Option<String>,
        allied_score: Option<u32>,
        axis_score: Option<u32>,
    },
    Other {
        label: String,
    },
}

/// Flat tag of an [`EventKind`], as stored in the `events.kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Kill,
    TeamKill,
    Connect,
    Disconnect,
    Chat,
    ServerMessage,
    SessionStart,
    SessionEnd,
    Other,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Kill => "kill",
            ActionKind::TeamKill => "team_kill",
            ActionKind::Connect => "connect",
            ActionKind::Disconnect => "disconnect",
            ActionKind::Chat => "chat",
            ActionKind::ServerMessage => "server_message",
            ActionKind::SessionStart => "session_start",
            ActionKind::SessionEnd => "session_end",
            ActionKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "kill" => ActionKind::Kill,
            "team_kill" => ActionKind::TeamKill,
            "connect" => ActionKind::Connect,
            "disconnect" => ActionKind::Disconnect,
            "chat" => ActionKind::Chat,
            "server_message" => ActionKind::ServerMessage,
            "session_start" => ActionKind::SessionStart,
            "session_end" => ActionKind::SessionEnd,
            "other" => ActionKind::Other,
            _ => return None,
        })
    }

    pub fn requires_actor(&self) -> bool {
        matches!(
            self,
            ActionKind::Kill
                | ActionKind::TeamKill
                | ActionKind::Connect
                | ActionKind::Disconnect
                | ActionKind::Chat
        )
    }
}

impl EventKind {
    pub fn action(&self) -> ActionKind {
        match self {
            EventKind::Kill { .. } => ActionKind::Kill,
            EventKind::TeamKill { .. } => ActionKind::TeamKill,
            EventKind::Connect => ActionKind::Connect,
            EventKind::Disconnect => ActionKind::Disconnect,
            EventKind::Chat { .. } => ActionKind::Chat,
            EventKind::ServerMessage { .. } => ActionKind::ServerMessage,
            EventKind::SessionStart { .. } => ActionKind::SessionStart,
            EventKind::SessionEnd { .. } => ActionKind::SessionEnd,
            EventKind::Other { .. } => ActionKind::Other,
        }
    }
}

/// A normalized event not yet reconciled against the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCandidate {
    pub source_id: Option<String>,
    pub server: String,
    pub at: DateTime<Utc>,
    pub raw_type: String,
    pub actor: Option<PlayerRef>,
    pub kind: EventKind,
    pub content: Option<String>,
    pub raw: Option<String>,
    pub fingerprint: String,
    pub payload_hash: String,
}

impl EventCandidate {
    pub fn at_ms(&self) -> i64 {
        self.at.timestamp_millis()
    }

    pub fn action(&self) -> ActionKind {
        self.kind.action()
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor.as_ref().map(|p| p.id.as_str())
    }

    pub fn target(&self) -> Option<&PlayerRef> {
        match &self.kind {
            EventKind::Kill { victim, .. } | EventKind::TeamKill { victim, .. } => victim.as_ref(),
            _ => None,
        }
    }

    pub fn target_id(&self) -> Option<&str> {
        self.target().map(|p| p.id.as_str())
    }

    pub fn weapon(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Kill { weapon, .. } | EventKind::TeamKill { weapon, .. } => weapon.as_deref(),
            _ => None,
        }
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self.action(), ActionKind::SessionStart | ActionKind::SessionEnd)
    }
}

pub struct Normalizer {
    markers: MarkerRules,
    bucket_ms: i64,
}

impl Normalizer {
    pub fn new(markers: MarkerRules, bucket_ms: i64) -> Self {
        Self {
            markers,
            bucket_ms: bucket_ms.max(1),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.markers.clone(), cfg.dedup_bucket_ms)
    }

    /// Normalize one record. `index` is its position in the batch, used in the error.
    pub fn normalize(&self, index: usize, rec: &RawRecord) -> Result<EventCandidate> {
        let malformed = |reason: &str| IngestError::Malformed {
            index,
            reason: reason.to_string(),
        };

        let ts = rec
            .event_time
            .as_ref()
            .ok_or_else(|| malformed("missing event_time"))?;
        let at = parse_timestamp(ts).map_err(|e| malformed(&e))?;

        let raw_type = rec
            .kind
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| malformed("missing action type"))?
            .to_string();

        let actor = player_ref(&rec.player1_id, &rec.player1_name);
        let victim = player_ref(&rec.player2_id, &rec.player2_name);
        let kind = self.classify(&raw_type, rec, victim);

        if kind.action().requires_actor() && actor.is_none() {
            return Err(malformed(&format!("{} without actor id", raw_type)));
        }

        let server = rec
            .server
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SERVER)
            .to_string();

        let mut cand = EventCandidate {
            source_id: rec.id.clone(),
            server,
            at,
            raw_type,
            actor,
            kind,
            content: rec.content.clone(),
            raw: rec.raw.clone(),
            fingerprint: String::new(),
            payload_hash: String::new(),
        };
        cand.fingerprint = self.fingerprint(&cand);
        cand.payload_hash = payload_hash(&cand);
        Ok(cand)
    }

    /// Normalize a whole batch, keeping successes in submission order.
    pub fn normalize_batch(&self, records: &[RawRecord]) -> (Vec<EventCandidate>, Vec<IngestError>) {
        let mut ok = Vec::with_capacity(records.len());
        let mut failed = Vec::new();
        for (i, rec) in records.iter().enumerate() {
            match self.normalize(i, rec) {
                Ok(c) => ok.push(c),
                Err(e) => failed.push(e),
            }
        }
        (ok, failed)
    }

    fn classify(&self, raw_type: &str, rec: &RawRecord, victim: Option<PlayerRef>) -> EventKind {
        let content = rec.content.as_deref().unwrap_or("");
        if self.markers.is_start(raw_type) {
            let (map, mode) = parse_start_content(raw_type, content);
            return EventKind::SessionStart { map, mode };
        }
        if self.markers.is_end(raw_type) {
            let (allied_score, axis_score) = parse_score(content).unzip();
            return EventKind::SessionEnd {
                map: parse_backticked(content),
                allied_score,
                axis_score,
            };
        }
        let weapon = rec.weapon.clone().filter(|w| !w.trim().is_empty());
        let upper = raw_type.to_uppercase();
        match upper.as_str() {
            "KILL" => EventKind::Kill { victim, weapon },
            "TEAM KILL" | "TEAMKILL" | "TEAM_KILL" => EventKind::TeamKill { victim, weapon },
            "CONNECTED" | "CONNECT" => EventKind::Connect,
            "DISCONNECTED" | "DISCONNECT" => EventKind::Disconnect,
            "MESSAGE" => EventKind::ServerMessage {
                message: content.to_string(),
            },
            t if t.starts_with("CHAT") => EventKind::Chat {
                channel: raw_type.get(4..).unwrap_or("").trim().to_string(),
                message: content.to_string(),
            },
            _ => EventKind::Other {
                label: raw_type.to_string(),
            },
        }
    }

    pub fn bucket_ms(&self) -> i64 {
        self.bucket_ms
    }

    /// Fingerprints `c` would have one bucket earlier and one bucket later.
    pub fn neighbour_fingerprints(&self, c: &EventCandidate) -> [String; 2] {
        let bucket = c.at_ms().div_euclid(self.bucket_ms);
        [
            self.fingerprint_in_bucket(c, bucket - 1),
            self.fingerprint_in_bucket(c, bucket + 1),
        ]
    }

    /// Identity hash: what makes two records the same logical event.
    fn fingerprint(&self, c: &EventCandidate) -> String {
        self.fingerprint_in_bucket(c, c.at_ms().div_euclid(self.bucket_ms))
    }

    fn fingerprint_in_bucket(&self, c: &EventCandidate, bucket: i64) -> String {
        let bucket = bucket.to_string();
        let text = match &c.kind {
            EventKind::Chat { channel, message } => format!("{}|{}", channel, message),
            EventKind::ServerMessage { message } => message.clone(),
            EventKind::Other { label } => format!("{}|{}", label, c.content.as_deref().unwrap_or("")),
            _ => String::new(),
        };
        sha256_hex(&[
            &c.server,
            &bucket,
            c.action().as_str(),
            c.actor_id().unwrap_or(""),
            c.target_id().unwrap_or(""),
            &text,
        ])
    }
}

/// Hash over everything the fingerprint leaves out. Differs between a record and its correction.
fn payload_hash(c: &EventCandidate) -> String {
    let details = serde_json::to_string(&c.kind).unwrap_or_default();
    sha256_hex(&[
        &c.raw_type,
        c.actor.as_ref().and_then(|p| p.name.as_deref()).unwrap_or(""),
        &c.at_ms().to_string(),
        &details,
        c.content.as_deref().unwrap_or(""),
        c.raw.as_deref().unwrap_or(""),
    ])
}

pub fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

fn player_ref(id: &Option<String>, name: &Option<String>) -> Option<PlayerRef> {
    let id = id.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
    Some(PlayerRef {
        id: id.to_string(),
        name: name.clone().filter(|n| !n.trim().is_empty()),
    })
}

/// Parse any of the accepted timestamp shapes into UTC.
pub fn parse_timestamp(ts: &RawTimestamp) -> std::result::Result<DateTime<Utc>, String> {
    match ts {
        RawTimestamp::Epoch(n) => from_epoch(*n),
        RawTimestamp::EpochFloat(f) => {
            if !f.is_finite() {
                return Err(format!("non-finite epoch {}", f));
            }
            if f.abs() >= EPOCH_MS_THRESHOLD as f64 {
                from_epoch(f.round() as i64)
            } else {
                Utc.timestamp_millis_opt((f * 1000.0).round() as i64)
                    .single()
                    .ok_or_else(|| format!("epoch out of range: {}", f))
            }
        }
        RawTimestamp::Text(s) => parse_text_timestamp(s),
    }
}

fn from_epoch(n: i64) -> std::result::Result<DateTime<Utc>, String> {
    let ms = if n.abs() >= EPOCH_MS_THRESHOLD { n } else { n.saturating_mul(1000) };
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| format!("epoch out of range: {}", n))
}

fn parse_text_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty timestamp".to_string());
    }
    if let Ok(n) = s.parse::<i64>() {
        return from_epoch(n);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(format!("unparsable timestamp {:?}", s))
}

/// `MATCH START CARENTAN Warfare` -> (`CARENTAN`, `Warfare`)
fn parse_start_content(raw_type: &str, content: &str) -> (Option<String>, Option<String>) {
    let trimmed = content.trim();
    let rest = if trimmed.len() >= raw_type.len()
        && trimmed.is_char_boundary(raw_type.len())
        && trimmed[..raw_type.len()].eq_ignore_ascii_case(raw_type)
    {
        trimmed[raw_type.len()..].trim()
    } else {
        trimmed
    };
    if rest.is_empty() {
        return (None, None);
    }
    match rest.rsplit_once(' ') {
        Some((map, mode)) => (Some(map.trim().to_string()), Some(mode.trim().to_string())),
        None => (Some(rest.to_string()), None),
    }
}

/// `... (2 - 3) ...` -> (2, 3)
fn parse_score(content: &str) -> Option<(u32, u32)> {
    let open = content.find('(')?;
    let close = open + content[open..].find(')')?;
    let (a, b) = content[open + 1..close].split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

fn parse_backticked(content: &str) -> Option<String> {
    let mut parts = content.split('`');
    parts.next()?;
    let inner = parts.next()?.trim();
    (!inner.is_empty()).then(|| inner.to_string())
}
