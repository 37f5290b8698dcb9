//! SQL migration definitions for the record store.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: records",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Exited records with every accumulated field
CREATE TABLE IF NOT EXISTS records (
    record_id       TEXT PRIMARY KEY,
    status          TEXT NOT NULL CHECK (status IN ('completed', 'rejected')),
    searchable      INTEGER NOT NULL,
    score           REAL,
    components_json TEXT,
    fields_json     TEXT NOT NULL,
    run_id          TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_status ON records(status);
CREATE INDEX IF NOT EXISTS idx_records_searchable ON records(searchable);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Run history",
            sql: r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id      TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    report_json TEXT
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
