use crate::derive::CURRENT_VERSION;

/// What to do with a record that fails normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Log it, count it in the batch report, keep going.
    Skip,
    /// Fail the whole batch before anything is written.
    Abort,
}

impl MalformedPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "skip" => Some(MalformedPolicy::Skip),
            "abort" => Some(MalformedPolicy::Abort),
            _ => None,
        }
    }
}

/// Raw `type` strings that open and close a session.
///
/// The log format does not carry an explicit session id, so boundaries are recognized by
/// exact (case-insensitive) match on the record type.
#[derive(Debug, Clone)]
pub struct MarkerRules {
    pub start_types: Vec<String>,
    pub end_types: Vec<String>,
}

impl Default for MarkerRules {
    fn default() -> Self {
        Self {
            start_types: vec!["MATCH START".to_string()],
            end_types: vec!["MATCH ENDED".to_string()],
        }
    }
}

impl MarkerRules {
    pub fn is_start(&self, raw_type: &str) -> bool {
        self.start_types.iter().any(|t| t.eq_ignore_ascii_case(raw_type.trim()))
    }

    pub fn is_end(&self, raw_type: &str) -> bool {
        self.end_types.iter().any(|t| t.eq_ignore_ascii_case(raw_type.trim()))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sqlite_path: String,
    pub log_folder: String,
    pub dedup_bucket_ms: i64,
    pub stale_session_secs: i64,
    pub derivation_version: u32,
    pub force_recompute: bool,
    pub malformed_policy: MalformedPolicy,
    pub markers: MarkerRules,
    pub seeding_marker: String,
    pub skip_seeding: bool,
    /// Seconds after a game's start that do not count towards time played.
    pub warmup_secs: i64,
    pub api_base: String,
    pub api_key: Option<String>,
    pub fetch_limit: u32,
    pub fetch_window_hours: i64,
    pub group_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sqlite_path: "./killfeed.sqlite".to_string(),
            log_folder: "./logs".to_string(),
            dedup_bucket_ms: 1000,
            stale_session_secs: 7200,
            derivation_version: CURRENT_VERSION,
            force_recompute: false,
            malformed_policy: MalformedPolicy::Skip,
            markers: MarkerRules::default(),
            seeding_marker: "THANK YOU FOR SEEDING".to_string(),
            skip_seeding: true,
            warmup_secs: 0,
            api_base: "https://gw-stats.hlladmin.com".to_string(),
            api_key: None,
            fetch_limit: 40_000,
            fetch_window_hours: 24,
            group_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            log_folder: std::env::var("LOG_FOLDER").unwrap_or(d.log_folder),
            dedup_bucket_ms: std::env::var("DEDUP_BUCKET_MS").ok().and_then(|v| v.parse().ok()).filter(|v: &i64| *v > 0).unwrap_or(d.dedup_bucket_ms),
            stale_session_secs: std::env::var("STALE_SESSION_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.stale_session_secs),
            derivation_version: std::env::var("DERIVATION_VERSION").ok().and_then(|v| v.parse().ok()).unwrap_or(d.derivation_version),
            force_recompute: std::env::var("FORCE_RECOMPUTE").map(|v| flag(&v)).unwrap_or(d.force_recompute),
            malformed_policy: std::env::var("MALFORMED_POLICY").ok().and_then(|v| MalformedPolicy::parse(&v)).unwrap_or(d.malformed_policy),
            markers: MarkerRules {
                start_types: std::env::var("SESSION_START_TYPES").map(|v| split_list(&v)).unwrap_or(d.markers.start_types),
                end_types: std::env::var("SESSION_END_TYPES").map(|v| split_list(&v)).unwrap_or(d.markers.end_types),
            },
            seeding_marker: std::env::var("SEEDING_MARKER").unwrap_or(d.seeding_marker),
            skip_seeding: std::env::var("SKIP_SEEDING").map(|v| flag(&v)).unwrap_or(d.skip_seeding),
            warmup_secs: std::env::var("WARMUP_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.warmup_secs),
            api_base: std::env::var("API_BASE").unwrap_or(d.api_base),
            api_key: std::env::var("API_KEY").ok(),
            fetch_limit: std::env::var("FETCH_LIMIT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.fetch_limit),
            fetch_window_hours: std::env::var("FETCH_WINDOW_HOURS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.fetch_window_hours),
            group_file: std::env::var("GROUP_FILE").ok(),
        }
    }

    pub fn stale_session_ms(&self) -> i64 {
        self.stale_session_secs.saturating_mul(1000)
    }
}

fn flag(v: &str) -> bool {
    matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_match_case_insensitively() {
        let rules = MarkerRules::default();
        assert!(rules.is_start("match start"));
        assert!(rules.is_end(" MATCH ENDED "));
        assert!(!rules.is_start("KILL"));
    }

    #[test]
    fn policy_parse() {
        assert_eq!(MalformedPolicy::parse("Abort"), Some(MalformedPolicy::Abort));
        assert_eq!(MalformedPolicy::parse("skip"), Some(MalformedPolicy::Skip));
        assert_eq!(MalformedPolicy::parse("ignore"), None);
    }

    #[test]
    fn list_splitting_drops_blanks() {
        assert_eq!(split_list("A, B,,C "), vec!["A", "B", "C"]);
    }
}
