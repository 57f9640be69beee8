//! Database schema and migrations.

use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 2;

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// Run pending migrations for the run database: tests, runs and session memory.
pub fn migrate_runs(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(VERSION_TABLE)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tests (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            definition TEXT NOT NULL DEFAULT '{}',
            auto_handle_popups INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS test_runs (
            id TEXT PRIMARY KEY,
            test_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued'
                CHECK (status IN ('queued', 'running', 'passed', 'failed')),
            started_at TEXT,
            completed_at TEXT,
            duration_ms INTEGER,
            screenshots TEXT NOT NULL DEFAULT '[]',
            logs TEXT NOT NULL DEFAULT '[]',
            step_results TEXT NOT NULL DEFAULT '[]',
            self_healed INTEGER NOT NULL DEFAULT 0,
            strategy_invocation_count INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            error TEXT,
            error_step INTEGER,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS session_memory (
            id INTEGER PRIMARY KEY,
            instruction_hash TEXT NOT NULL UNIQUE,
            page_url TEXT NOT NULL,
            instruction TEXT NOT NULL,
            action_data TEXT NOT NULL,
            reliability_score REAL NOT NULL DEFAULT 1.0
                CHECK (reliability_score >= 0.0 AND reliability_score <= 1.0),
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_used TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_test_runs_status ON test_runs(status, started_at);",
    )?;

    // v2: runs carry a liveness heartbeat and a failure classification
    add_column(conn, "test_runs", "heartbeat_at", "TEXT")?;
    add_column(conn, "test_runs", "error_kind", "TEXT")?;

    record_version(conn)
}

/// Run pending migrations for the queue database: the stream tables and run events.
pub fn migrate_queue(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(VERSION_TABLE)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS queue_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stream TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS queue_groups (
            stream TEXT NOT NULL,
            group_name TEXT NOT NULL,
            last_delivered_id INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            PRIMARY KEY (stream, group_name)
        );

        CREATE TABLE IF NOT EXISTS queue_pending (
            stream TEXT NOT NULL,
            group_name TEXT NOT NULL,
            entry_id INTEGER NOT NULL,
            consumer TEXT,
            delivery_token TEXT NOT NULL,
            delivered_at TEXT,
            delivery_count INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (stream, group_name, entry_id)
        );

        CREATE TABLE IF NOT EXISTS queue_dead_letters (
            id INTEGER PRIMARY KEY,
            stream TEXT NOT NULL,
            group_name TEXT NOT NULL,
            entry_id INTEGER NOT NULL,
            payload_json TEXT NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS run_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (run_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_queue_entries_stream ON queue_entries(stream, id);
        CREATE INDEX IF NOT EXISTS idx_queue_pending_delivered ON queue_pending(stream, group_name, delivered_at);
        CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id, seq);",
    )?;

    record_version(conn)
}

fn add_column(conn: &Connection, table: &str, column: &str, ddl: &str) -> rusqlite::Result<()> {
    let present: i64 = conn.query_row(
        &format!("SELECT count(*) FROM pragma_table_info('{table}') WHERE name = ?1"),
        [column],
        |row| row.get(0),
    )?;
    if present == 0 {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"), [])?;
    }
    Ok(())
}

fn record_version(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}
