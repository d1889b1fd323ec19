//! SQLite schema for the help-text cache.

pub const SCHEMA: &str = r#"
-- One row per traced capture of a command. `fingerprint` is deliberately
-- not unique: re-capturing the same command line appends a new row and
-- lookup prefers the highest id.
CREATE TABLE IF NOT EXISTS command (
    id             INTEGER PRIMARY KEY,
    argv           TEXT        NOT NULL,
    fingerprint    TEXT        NOT NULL,
    ctime          INTEGER     NOT NULL,
    atime          INTEGER     NOT NULL,
    help_text      BLOB        NOT NULL,
    exit_status    INTEGER     NOT NULL
);

-- One row per observed dependency-file content, deduplicated by
-- fingerprint. Rows are never updated or deleted; changed content means
-- a new row.
CREATE TABLE IF NOT EXISTS file (
    id             INTEGER PRIMARY KEY,
    path           TEXT        NOT NULL,
    fingerprint    TEXT        NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS command_file (
    command_id     INTEGER     NOT NULL,
    file_id        INTEGER     NOT NULL,
    UNIQUE(command_id, file_id),
    FOREIGN KEY (command_id) REFERENCES command (id),
    FOREIGN KEY (file_id) REFERENCES file (id)
);

CREATE INDEX IF NOT EXISTS idx_command_fingerprint ON command (fingerprint);
"#;
