/// Schema for the response cache and the outbox.
///
/// Both live in one database file but share nothing: cache rows belong to a
/// generation and vanish with it, outbox rows are only removed after delivery.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per named cache generation (e.g. "v2-static")
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Stored responses keyed by request identity hash
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    identity_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    kind TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (generation, identity_key),
    FOREIGN KEY (generation) REFERENCES cache_generations(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_identity
    ON cache_entries(identity_key, stored_at);

-- The version that last completed activation (at most one row)
CREATE TABLE IF NOT EXISTS active_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version TEXT NOT NULL,
    activated_at TEXT NOT NULL
);

-- Pending safety-critical payloads; AUTOINCREMENT keeps ids monotonic
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    stored_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT
);
"#;
