use serde::{Deserialize, Serialize};

use kbisect_core::{
    BlobId, ErrorKind, HostId, HostRowId, HostVerdict, IterationId, IterationVerdict, MarkState,
    MetadataId, Phase, SessionId, SessionStatus,
};

/// Kind of large text artifact owned by an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Build,
    Console,
    Test,
}

impl LogKind {
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Console => "console",
            Self::Test => "test",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "build" => Some(Self::Build),
            "console" => Some(Self::Console),
            "test" => Some(Self::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub good_ref: String,
    pub bad_ref: String,
    pub status: SessionStatus,
    pub result_commit: Option<String>,
    pub config_json: String,
    pub created_at: String,
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationRecord {
    pub iteration_id: IterationId,
    pub session_id: SessionId,
    pub index: u32,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub verdict: IterationVerdict,
    pub mark_state: MarkState,
    pub error_summary: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub host_row_id: HostRowId,
    pub session_id: SessionId,
    pub host: HostId,
    pub ssh_user: String,
    pub kernel_path: String,
    pub power_control: String,
    pub test_script: Option<String>,
}

/// Stored per-host outcome row, as read back for reports and resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHostOutcome {
    pub iteration_id: IterationId,
    pub host: HostId,
    pub phase: Phase,
    pub verdict: HostVerdict,
    pub observed_kernel: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub build_log: Option<BlobId>,
    pub console_log: Option<BlobId>,
    pub test_log: Option<BlobId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBlobRecord {
    pub blob_id: BlobId,
    pub iteration_id: IterationId,
    pub host: HostId,
    pub kind: LogKind,
    /// Uncompressed size in bytes.
    pub size_bytes: u64,
    pub content_sha256: Option<String>,
    pub exit_code: Option<i64>,
    pub finalized: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub metadata_id: MetadataId,
    pub session_id: SessionId,
    pub iteration_id: Option<IterationId>,
    pub content_sha256: String,
    pub payload: String,
    pub created_at: String,
}

/// Read-only rollup used by `status` and `report`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: i64,
    pub good_ref: String,
    pub bad_ref: String,
    pub status: String,
    pub result_commit: Option<String>,
    pub created_at: String,
    pub ended_at: Option<String>,
    pub iteration_count: u32,
    pub good_count: u32,
    pub bad_count: u32,
    pub skip_count: u32,
    pub pending_count: u32,
}
