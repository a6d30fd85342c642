use rusqlite::Connection;

pub fn init_db(path: &str) -> Connection {
    let conn = Connection::open(path).expect("Failed to open database");

    // Enable WAL mode for concurrent reads
    conn.execute_batch("PRAGMA journal_mode=WAL;")
        .expect("Failed to enable WAL mode");

    // Checkpoint any pending WAL data before running migrations.
    // This prevents data loss when upgrading the binary (old WAL + new schema = bad).
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .expect("Failed to checkpoint WAL");

    init_schema(&conn);
    conn
}

/// Schema init, shared with in-memory test connections.
pub fn init_schema(conn: &Connection) {
    conn.execute_batch(
        "
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            priority TEXT NOT NULL DEFAULT 'normal',
            current_turn TEXT NOT NULL DEFAULT 'user',
            project_path TEXT,
            ssh_host TEXT,
            ssh_user TEXT,
            estimated_duration INTEGER,
            actual_duration INTEGER,
            max_retries INTEGER NOT NULL DEFAULT 3,
            retry_count INTEGER NOT NULL DEFAULT 0,
            progress INTEGER NOT NULL DEFAULT 0,
            ai_context TEXT,
            error_message TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_by TEXT NOT NULL,
            updated_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            sender TEXT NOT NULL,
            related_file_name TEXT,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_created_by ON tasks(created_by);
        CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_title_creator ON tasks(title, created_by, is_deleted);
        CREATE INDEX IF NOT EXISTS idx_messages_task_id ON messages(task_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(task_id, sender, created_at);
        ",
    )
    .expect("Failed to initialize database schema");
}
