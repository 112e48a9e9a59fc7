use butler_db::{Chain, Migration};

/// Memory schema as a migration chain so the daemon applies it through the
/// same `run_migrations` entry point as every module chain.
pub const MEMORY_CHAIN: Chain = Chain {
    name: "memory",
    migrations: &[
        Migration {
            revision: "mem_001",
            down_revision: None,
            up_sql: "
                CREATE TABLE IF NOT EXISTS episodes (
                    id                 TEXT PRIMARY KEY,
                    tenant_id          TEXT NOT NULL DEFAULT 'default',
                    content            TEXT NOT NULL,
                    source_butler      TEXT NOT NULL,
                    session_id         TEXT,
                    embedding          TEXT,
                    decay_rate         REAL NOT NULL DEFAULT 0.008,
                    expires_at         TEXT,
                    reference_count    INTEGER NOT NULL DEFAULT 0,
                    last_referenced_at TEXT,
                    created_at         TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_episodes_butler
                    ON episodes(source_butler, created_at DESC);

                CREATE TABLE IF NOT EXISTS facts (
                    id                 TEXT PRIMARY KEY,
                    tenant_id          TEXT NOT NULL DEFAULT 'default',
                    subject            TEXT NOT NULL,
                    predicate          TEXT NOT NULL,
                    content            TEXT NOT NULL,
                    scope              TEXT NOT NULL DEFAULT 'global',
                    permanence         TEXT NOT NULL DEFAULT 'standard',
                    decay_rate         REAL NOT NULL DEFAULT 0.008,
                    validity           TEXT NOT NULL DEFAULT 'active',
                    supersedes_id      TEXT,
                    reference_count    INTEGER NOT NULL DEFAULT 0,
                    last_referenced_at TEXT,
                    created_at         TEXT NOT NULL,
                    updated_at         TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_facts_triple
                    ON facts(subject, predicate, scope, validity);

                CREATE TABLE IF NOT EXISTS rules (
                    id                 TEXT PRIMARY KEY,
                    tenant_id          TEXT NOT NULL DEFAULT 'default',
                    content            TEXT NOT NULL,
                    scope              TEXT NOT NULL DEFAULT 'global',
                    metadata           TEXT NOT NULL DEFAULT '{}',
                    reference_count    INTEGER NOT NULL DEFAULT 0,
                    last_referenced_at TEXT,
                    created_at         TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS memory_links (
                    id         INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_id  TEXT NOT NULL,
                    target_id  TEXT NOT NULL,
                    relation   TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_links_source
                    ON memory_links(source_id, relation);
            ",
            down_sql: "
                DROP TABLE IF EXISTS memory_links;
                DROP TABLE IF EXISTS rules;
                DROP TABLE IF EXISTS facts;
                DROP TABLE IF EXISTS episodes;
            ",
        },
        Migration {
            revision: "mem_002",
            down_revision: Some("mem_001"),
            up_sql: "
                CREATE TABLE IF NOT EXISTS memory_events (
                    id         INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id  TEXT NOT NULL DEFAULT 'default',
                    kind       TEXT NOT NULL,
                    payload    TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE TRIGGER IF NOT EXISTS memory_events_no_update
                    BEFORE UPDATE ON memory_events
                BEGIN
                    SELECT RAISE(ABORT, 'memory_events is append-only');
                END;
                CREATE TRIGGER IF NOT EXISTS memory_events_no_delete
                    BEFORE DELETE ON memory_events
                BEGIN
                    SELECT RAISE(ABORT, 'memory_events is append-only');
                END;
            ",
            down_sql: "
                DROP TRIGGER IF EXISTS memory_events_no_delete;
                DROP TRIGGER IF EXISTS memory_events_no_update;
                DROP TABLE IF EXISTS memory_events;
            ",
        },
        Migration {
            revision: "mem_003",
            down_revision: Some("mem_002"),
            // External-content FTS index over episode and fact text, synced
            // manually on write.
            up_sql: "
                CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts
                    USING fts5(item_id UNINDEXED, kind UNINDEXED, content);
            ",
            down_sql: "DROP TABLE IF EXISTS memory_fts;",
        },
    ],
};
