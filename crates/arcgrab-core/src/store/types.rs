//! Types used by the state store.

/// Row id of an item within the state file.
pub type ItemId = i64;

/// Row id of a file within the state file.
pub type FileId = i64;

/// Resolution status of one archive item, stored as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Resolving,
    Resolved,
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Resolving => "resolving",
            ItemStatus::Resolved => "resolved",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => ItemStatus::Pending,
            "resolving" => ItemStatus::Resolving,
            "resolved" => ItemStatus::Resolved,
            _ => ItemStatus::Failed,
        }
    }
}

/// Transfer status of one remote file, stored as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::InProgress => "in_progress",
            FileStatus::Done => "done",
            FileStatus::Failed => "failed",
            FileStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => FileStatus::Pending,
            "in_progress" => FileStatus::InProgress,
            "done" => FileStatus::Done,
            "skipped" => FileStatus::Skipped,
            _ => FileStatus::Failed,
        }
    }
}

/// Persisted job row. The config is stored as JSON so the schema stays
/// flexible while the config struct evolves.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub output_root: String,
    pub config_json: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One archive identifier within a job.
#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub id: ItemId,
    pub identifier: String,
    pub status: ItemStatus,
    pub last_error: Option<String>,
}

/// One remote file belonging to an item.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: FileId,
    pub item_id: ItemId,
    /// Remote logical name within the item.
    pub name: String,
    /// Remote size in bytes; 0 = unknown.
    pub size: i64,
    /// Published digest (lowercase hex), if any.
    pub checksum: Option<String>,
    /// Absolute destination path of the final object.
    pub dest_path: String,
    pub bytes_done: i64,
    pub status: FileStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// Terminal HTTP status, when a failure had one.
    pub http_status: Option<i64>,
}

/// A filtered manifest entry ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub name: String,
    pub size: i64,
    pub checksum: Option<String>,
    pub dest_path: String,
}

/// Terminal update written back when a worker returns a file.
#[derive(Debug, Clone)]
pub struct FileUpdate {
    pub status: FileStatus,
    pub bytes_done: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub http_status: Option<i64>,
}

/// Aggregate counts for one job, used for snapshots and exit decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl ProgressCounts {
    pub fn total_files(&self) -> u64 {
        self.pending + self.in_progress + self.done + self.failed + self.skipped
    }

    /// True when no file can still make progress.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}
