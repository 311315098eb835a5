/// Bumped whenever a table changes shape. Stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 2;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS players (
    player_id TEXT PRIMARY KEY,
    current_name TEXT NOT NULL,
    first_seen_ms INTEGER NOT NULL,
    last_seen_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS player_names (
    player_id TEXT NOT NULL REFERENCES players(player_id),
    name TEXT NOT NULL,
    first_seen_ms INTEGER NOT NULL,
    PRIMARY KEY (player_id, name)
);

CREATE TABLE IF NOT EXISTS games (
    game_key TEXT PRIMARY KEY,
    server TEXT NOT NULL,
    game_number INTEGER NOT NULL,
    start_ms INTEGER NOT NULL,
    end_ms INTEGER,
    last_event_ms INTEGER NOT NULL,
    ended INTEGER NOT NULL DEFAULT 0,
    truncated INTEGER NOT NULL DEFAULT 0,
    seeding INTEGER NOT NULL DEFAULT 0,
    map TEXT,
    mode TEXT,
    duration_secs INTEGER,
    allied_score INTEGER,
    axis_score INTEGER,
    winner TEXT,
    UNIQUE (server, game_number)
);
CREATE INDEX IF NOT EXISTS idx_games_server_start ON games(server, start_ms);
CREATE INDEX IF NOT EXISTS idx_games_open ON games(server) WHERE end_ms IS NULL;

CREATE TABLE IF NOT EXISTS events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT,
    fingerprint TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    server TEXT NOT NULL,
    event_ms INTEGER NOT NULL,
    kind TEXT NOT NULL,
    raw_type TEXT NOT NULL,
    actor_id TEXT REFERENCES players(player_id),
    actor_name TEXT,
    target_id TEXT REFERENCES players(player_id),
    target_name TEXT,
    weapon TEXT,
    content TEXT,
    raw TEXT,
    game_key TEXT NOT NULL REFERENCES games(game_key),
    superseded INTEGER NOT NULL DEFAULT 0,
    superseded_by INTEGER REFERENCES events(event_id),
    inserted_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_live_fingerprint ON events(fingerprint) WHERE superseded = 0;
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_fingerprint_payload ON events(fingerprint, payload_hash);
CREATE INDEX IF NOT EXISTS idx_events_game_time ON events(game_key, event_ms);
CREATE INDEX IF NOT EXISTS idx_events_actor_time ON events(actor_id, event_ms);
CREATE INDEX IF NOT EXISTS idx_events_target_time ON events(target_id, event_ms);
CREATE INDEX IF NOT EXISTS idx_events_kind_time ON events(kind, event_ms);

CREATE TABLE IF NOT EXISTS game_players (
    game_key TEXT NOT NULL REFERENCES games(game_key),
    player_id TEXT NOT NULL REFERENCES players(player_id),
    PRIMARY KEY (game_key, player_id)
);
CREATE INDEX IF NOT EXISTS idx_game_players_player ON game_players(player_id);

CREATE TABLE IF NOT EXISTS pending_events (
    fingerprint TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    server TEXT NOT NULL,
    event_ms INTEGER NOT NULL,
    candidate TEXT NOT NULL,
    held_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (fingerprint, payload_hash)
);

CREATE TABLE IF NOT EXISTS game_analyses (
    game_key TEXT NOT NULL REFERENCES games(game_key),
    version INTEGER NOT NULL,
    input_digest TEXT NOT NULL,
    players INTEGER NOT NULL,
    truncated INTEGER NOT NULL,
    PRIMARY KEY (game_key, version)
);

CREATE TABLE IF NOT EXISTS player_analyses (
    game_key TEXT NOT NULL,
    version INTEGER NOT NULL,
    player_id TEXT NOT NULL REFERENCES players(player_id),
    kills INTEGER NOT NULL,
    deaths INTEGER NOT NULL,
    team_kills INTEGER NOT NULL,
    team_deaths INTEGER NOT NULL,
    seconds_played REAL NOT NULL,
    kpm REAL NOT NULL,
    dpm REAL NOT NULL,
    ratio REAL NOT NULL,
    truncated INTEGER NOT NULL,
    weapon_kills TEXT NOT NULL,
    weapon_deaths TEXT NOT NULL,
    victims TEXT NOT NULL,
    nemeses TEXT NOT NULL,
    kill_distribution TEXT NOT NULL DEFAULT '{}',
    death_distribution TEXT NOT NULL DEFAULT '{}',
    team_kill_distribution TEXT NOT NULL DEFAULT '{}',
    team_death_distribution TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (game_key, player_id, version),
    FOREIGN KEY (game_key, version) REFERENCES game_analyses(game_key, version) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_player_analyses_player ON player_analyses(player_id, version);

CREATE TABLE IF NOT EXISTS processed_files (
    sha256 TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    ingested_at TEXT NOT NULL
);
";

/// Brings a version 1 database up to version 2: offset-keyed kill and death lists.
pub const MIGRATE_V2: &str = "
ALTER TABLE player_analyses ADD COLUMN kill_distribution TEXT NOT NULL DEFAULT '{}';
ALTER TABLE player_analyses ADD COLUMN death_distribution TEXT NOT NULL DEFAULT '{}';
ALTER TABLE player_analyses ADD COLUMN team_kill_distribution TEXT NOT NULL DEFAULT '{}';
ALTER TABLE player_analyses ADD COLUMN team_death_distribution TEXT NOT NULL DEFAULT '{}';
";
