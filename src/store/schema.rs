//! Table layouts. Names and column types are part of the on-disk format.

/// Log store file name inside the repository directory.
pub const DB_FILE: &str = "vcsdb.sqlite3";

pub const STAGING_TABLE: &str = "stagingLog";
pub const ACTIVITY_TABLE: &str = "activityRecordLog";

/// A table and the DDL that creates it.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    pub create_sql: &'static str,
}

pub fn staging_table() -> TableSpec {
    TableSpec {
        name: STAGING_TABLE,
        create_sql: "CREATE TABLE IF NOT EXISTS stagingLog (
            storageTime BIGINT,
            changedTime BIGINT,
            fileUrl TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_stagingLog_fileUrl ON stagingLog(fileUrl);",
    }
}

pub fn activity_table() -> TableSpec {
    TableSpec {
        name: ACTIVITY_TABLE,
        create_sql: "CREATE TABLE IF NOT EXISTS activityRecordLog (
            recordTime BIGINT,
            activityId BIGINT,
            branch TEXT,
            accountId TEXT,
            activityType INT,
            description TEXT
        );",
    }
}
