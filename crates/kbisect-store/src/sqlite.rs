use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

use kbisect_core::{
    BlobId, ErrorKind, HostId, HostOutcome, HostRowId, HostVerdict, IterationId, IterationVerdict,
    MarkState, MetadataId, Phase, SessionId, SessionStatus,
};

use crate::records::{
    HostRecord, IterationRecord, LogBlobRecord, LogKind, MetadataRecord, SessionRecord,
    SessionSummary, StoredHostOutcome,
};
use crate::{StoreError, StoreResult};

const CURRENT_SCHEMA_VERSION: u32 = 1;

/// SQLite-backed store. All public calls are individually transactional and
/// safe to issue from concurrent tasks; the connection is serialized behind a
/// mutex and every call is short and bounded.
pub struct Store {
    conn: Mutex<Connection>,
}

/// Host fields frozen into the store at session creation.
#[derive(Debug, Clone)]
pub struct NewHost<'a> {
    pub host: &'a HostId,
    pub ssh_user: &'a str,
    pub kernel_path: &'a str,
    pub power_control: &'a str,
    pub test_script: Option<&'a str>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn =
            Connection::open(path).map_err(|err| StoreError::Io(err.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| StoreError::Io(err.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.bootstrap()?;
        Ok(store)
    }

    pub fn in_memory() -> StoreResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|err| StoreError::Io(err.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.bootstrap()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Io("store connection mutex poisoned".to_owned()))
    }

    fn bootstrap(&self) -> StoreResult<()> {
        let mut conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|err| StoreError::Io(err.to_string()))?;

        let current = current_schema_version(&conn)?;
        if current > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::Corrupt(format!(
                "database schema version {current} is newer than supported {CURRENT_SCHEMA_VERSION}"
            )));
        }

        for version in (current + 1)..=CURRENT_SCHEMA_VERSION {
            let tx = conn
                .transaction()
                .map_err(|err| StoreError::Io(err.to_string()))?;
            apply_migration(&tx, version)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at)
                 VALUES (?1, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
                params![version],
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
            tx.commit().map_err(|err| StoreError::Io(err.to_string()))?;
        }

        // A blob that was never finalized belongs to a write interrupted by
        // a crash; its content cannot be trusted.
        let discarded = conn
            .execute("DELETE FROM log_blobs WHERE finalized = 0", [])
            .map_err(|err| StoreError::Io(err.to_string()))?;
        if discarded > 0 {
            debug!(discarded, "discarded unfinalized log blobs from a previous run");
        }

        Ok(())
    }

    // ---- sessions -------------------------------------------------------

    pub fn create_session(
        &self,
        good_ref: &str,
        bad_ref: &str,
        config_json: &str,
    ) -> StoreResult<SessionId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (good_ref, bad_ref, status, config_json, created_at)
             VALUES (?1, ?2, 'running', ?3, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
            params![good_ref, bad_ref, config_json],
        )
        .map_err(|err| StoreError::Io(err.to_string()))?;
        Ok(SessionId::new(conn.last_insert_rowid()))
    }

    /// Return the latest non-terminal session, or atomically create one.
    /// The boolean is true when a new session was created.
    pub fn get_or_create_session(
        &self,
        good_ref: &str,
        bad_ref: &str,
        config_json: &str,
    ) -> StoreResult<(SessionId, bool)> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|err| StoreError::Io(err.to_string()))?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT session_id FROM sessions
                 WHERE status IN ('running', 'halted')
                 ORDER BY session_id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| StoreError::Io(err.to_string()))?;

        if let Some(session_id) = existing {
            tx.commit().map_err(|err| StoreError::Io(err.to_string()))?;
            return Ok((SessionId::new(session_id), false));
        }

        tx.execute(
            "INSERT INTO sessions (good_ref, bad_ref, status, config_json, created_at)
             VALUES (?1, ?2, 'running', ?3, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
            params![good_ref, bad_ref, config_json],
        )
        .map_err(|err| StoreError::Io(err.to_string()))?;
        let session_id = tx.last_insert_rowid();
        tx.commit().map_err(|err| StoreError::Io(err.to_string()))?;
        Ok((SessionId::new(session_id), true))
    }

    pub fn session(&self, session_id: SessionId) -> StoreResult<SessionRecord> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT session_id, good_ref, bad_ref, status, result_commit, config_json,
                    created_at, ended_at
             FROM sessions WHERE session_id = ?1",
            params![session_id.value()],
            map_session_row,
        )
        .optional()
        .map_err(|err| StoreError::Io(err.to_string()))?
        .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))
    }

    pub fn latest_session(&self) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT session_id, good_ref, bad_ref, status, result_commit, config_json,
                    created_at, ended_at
             FROM sessions ORDER BY session_id DESC LIMIT 1",
            [],
            map_session_row,
        )
        .optional()
        .map_err(|err| StoreError::Io(err.to_string()))
    }

    /// Latest session still in `running` or `halted`.
    pub fn latest_open_session(&self) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT session_id, good_ref, bad_ref, status, result_commit, config_json,
                    created_at, ended_at
             FROM sessions
             WHERE status IN ('running', 'halted')
             ORDER BY session_id DESC LIMIT 1",
            [],
            map_session_row,
        )
        .optional()
        .map_err(|err| StoreError::Io(err.to_string()))
    }

    pub fn update_session_status(
        &self,
        session_id: SessionId,
        status: SessionStatus,
        result_commit: Option<&str>,
    ) -> StoreResult<()> {
        let ended = status.is_terminal();
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE sessions
                 SET status = ?2,
                     result_commit = COALESCE(?3, result_commit),
                     ended_at = CASE WHEN ?4 THEN strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                                     ELSE ended_at END
                 WHERE session_id = ?1",
                params![session_id.value(), status.as_key(), result_commit, ended],
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    // ---- hosts ----------------------------------------------------------

    pub fn create_host(&self, session_id: SessionId, host: NewHost<'_>) -> StoreResult<HostRowId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO hosts (session_id, hostname, ssh_user, kernel_path, power_control, test_script)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id, hostname) DO UPDATE SET
                 ssh_user = excluded.ssh_user,
                 kernel_path = excluded.kernel_path,
                 power_control = excluded.power_control,
                 test_script = excluded.test_script",
            params![
                session_id.value(),
                host.host.as_str(),
                host.ssh_user,
                host.kernel_path,
                host.power_control,
                host.test_script,
            ],
        )
        .map_err(|err| StoreError::Io(err.to_string()))?;

        conn.query_row(
            "SELECT host_row_id FROM hosts WHERE session_id = ?1 AND hostname = ?2",
            params![session_id.value(), host.host.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .map(HostRowId::new)
        .map_err(|err| StoreError::Io(err.to_string()))
    }

    pub fn hosts(&self, session_id: SessionId) -> StoreResult<Vec<HostRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT host_row_id, session_id, hostname, ssh_user, kernel_path,
                        power_control, test_script
                 FROM hosts WHERE session_id = ?1 ORDER BY host_row_id ASC",
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
        let rows = stmt
            .query_map(params![session_id.value()], |row| {
                Ok(HostRecord {
                    host_row_id: HostRowId::new(row.get(0)?),
                    session_id: SessionId::new(row.get(1)?),
                    host: HostId::new(row.get::<_, String>(2)?),
                    ssh_user: row.get(3)?,
                    kernel_path: row.get(4)?,
                    power_control: row.get(5)?,
                    test_script: row.get(6)?,
                })
            })
            .map_err(|err| StoreError::Io(err.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::Io(err.to_string()))
    }

    // ---- iterations -----------------------------------------------------

    pub fn create_iteration(
        &self,
        session_id: SessionId,
        index: u32,
        commit_sha: &str,
        commit_message: &str,
    ) -> StoreResult<IterationId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO iterations
                 (session_id, idx, commit_sha, commit_message, verdict, mark_state, started_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 'none', strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
            params![session_id.value(), index, commit_sha, commit_message],
        )
        .map_err(|err| StoreError::Io(err.to_string()))?;
        Ok(IterationId::new(conn.last_insert_rowid()))
    }

    pub fn iteration(&self, iteration_id: IterationId) -> StoreResult<IterationRecord> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT iteration_id, session_id, idx, commit_sha, commit_message, verdict,
                    mark_state, error_summary, started_at, ended_at
             FROM iterations WHERE iteration_id = ?1",
            params![iteration_id.value()],
            map_iteration_row,
        )
        .optional()
        .map_err(|err| StoreError::Io(err.to_string()))?
        .ok_or_else(|| StoreError::NotFound(format!("iteration {iteration_id}")))
    }

    pub fn iterations(&self, session_id: SessionId) -> StoreResult<Vec<IterationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT iteration_id, session_id, idx, commit_sha, commit_message, verdict,
                        mark_state, error_summary, started_at, ended_at
                 FROM iterations WHERE session_id = ?1 ORDER BY idx ASC",
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
        let rows = stmt
            .query_map(params![session_id.value()], map_iteration_row)
            .map_err(|err| StoreError::Io(err.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::Io(err.to_string()))
    }

    pub fn latest_iteration(&self, session_id: SessionId) -> StoreResult<Option<IterationRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT iteration_id, session_id, idx, commit_sha, commit_message, verdict,
                    mark_state, error_summary, started_at, ended_at
             FROM iterations WHERE session_id = ?1 ORDER BY idx DESC LIMIT 1",
            params![session_id.value()],
            map_iteration_row,
        )
        .optional()
        .map_err(|err| StoreError::Io(err.to_string()))
    }

    pub fn set_iteration_error(
        &self,
        iteration_id: IterationId,
        error_summary: &str,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE iterations SET error_summary = ?2 WHERE iteration_id = ?1",
            params![iteration_id.value(), error_summary],
        )
        .map_err(|err| StoreError::Io(err.to_string()))?;
        Ok(())
    }

    /// First half of the iteration close pairing: record the final verdict
    /// with `mark_state = marking` before the VCS mark is attempted. A crash
    /// after this write is reconcilable from the VCS bisect log.
    pub fn begin_iteration_close(
        &self,
        iteration_id: IterationId,
        verdict: IterationVerdict,
        error_summary: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE iterations
                 SET verdict = ?2,
                     mark_state = 'marking',
                     error_summary = COALESCE(?3, error_summary)
                 WHERE iteration_id = ?1",
                params![iteration_id.value(), verdict.as_key(), error_summary],
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("iteration {iteration_id}")));
        }
        Ok(())
    }

    /// Second half of the close pairing, after the VCS mark committed.
    pub fn finish_iteration_close(&self, iteration_id: IterationId) -> StoreResult<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE iterations
                 SET mark_state = 'marked',
                     ended_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE iteration_id = ?1",
                params![iteration_id.value()],
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("iteration {iteration_id}")));
        }
        Ok(())
    }

    /// Drop an iteration that never reached a verdict or a mark. Used by
    /// resume when neither the store nor the VCS completed the close.
    pub fn discard_dangling_iteration(&self, iteration_id: IterationId) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|err| StoreError::Io(err.to_string()))?;
        tx.execute(
            "DELETE FROM log_blobs WHERE iteration_id = ?1",
            params![iteration_id.value()],
        )
        .map_err(|err| StoreError::Io(err.to_string()))?;
        tx.execute(
            "DELETE FROM host_outcomes WHERE iteration_id = ?1",
            params![iteration_id.value()],
        )
        .map_err(|err| StoreError::Io(err.to_string()))?;
        tx.execute(
            "DELETE FROM iterations WHERE iteration_id = ?1 AND mark_state = 'none'",
            params![iteration_id.value()],
        )
        .map_err(|err| StoreError::Io(err.to_string()))?;
        tx.commit().map_err(|err| StoreError::Io(err.to_string()))
    }

    // ---- host outcomes --------------------------------------------------

    pub fn put_host_outcome(
        &self,
        iteration_id: IterationId,
        outcome: &HostOutcome,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO host_outcomes
                 (iteration_id, host_id, phase, verdict, observed_kernel,
                  error_kind, error_detail, build_log_id, console_log_id, test_log_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(iteration_id, host_id) DO UPDATE SET
                 phase = excluded.phase,
                 verdict = excluded.verdict,
                 observed_kernel = excluded.observed_kernel,
                 error_kind = excluded.error_kind,
                 error_detail = excluded.error_detail,
                 build_log_id = COALESCE(excluded.build_log_id, host_outcomes.build_log_id),
                 console_log_id = COALESCE(excluded.console_log_id, host_outcomes.console_log_id),
                 test_log_id = COALESCE(excluded.test_log_id, host_outcomes.test_log_id)",
            params![
                iteration_id.value(),
                outcome.host.as_str(),
                outcome.phase.as_key(),
                outcome.verdict.as_key(),
                outcome.observed_kernel,
                outcome.error_kind.map(|kind| kind.as_key()),
                outcome.error,
                outcome.build_log.map(BlobId::value),
                outcome.console_log.map(BlobId::value),
                outcome.test_log.map(BlobId::value),
            ],
        )
        .map_err(|err| StoreError::Io(err.to_string()))?;
        Ok(())
    }

    pub fn host_outcomes(&self, iteration_id: IterationId) -> StoreResult<Vec<StoredHostOutcome>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT iteration_id, host_id, phase, verdict, observed_kernel,
                        error_kind, error_detail, build_log_id, console_log_id, test_log_id
                 FROM host_outcomes WHERE iteration_id = ?1 ORDER BY host_id ASC",
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
        let rows = stmt
            .query_map(params![iteration_id.value()], |row| {
                let phase_key: String = row.get(2)?;
                let verdict_key: String = row.get(3)?;
                let error_kind_key: Option<String> = row.get(5)?;
                Ok(StoredHostOutcome {
                    iteration_id: IterationId::new(row.get(0)?),
                    host: HostId::new(row.get::<_, String>(1)?),
                    phase: Phase::from_key(&phase_key).unwrap_or(Phase::Build),
                    verdict: HostVerdict::from_key(&verdict_key).unwrap_or(HostVerdict::Skip),
                    observed_kernel: row.get(4)?,
                    error_kind: error_kind_key.as_deref().and_then(ErrorKind::from_key),
                    error: row.get(6)?,
                    build_log: row.get::<_, Option<i64>>(7)?.map(BlobId::new),
                    console_log: row.get::<_, Option<i64>>(8)?.map(BlobId::new),
                    test_log: row.get::<_, Option<i64>>(9)?.map(BlobId::new),
                })
            })
            .map_err(|err| StoreError::Io(err.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::Io(err.to_string()))
    }

    // ---- log blobs ------------------------------------------------------

    /// Allocate an open blob row; it stays invisible to readers until
    /// finalized, and is discarded on next open if never finalized. Use
    /// [`crate::LogBlobWriter::open`] rather than calling this directly.
    pub(crate) fn create_log_blob(
        &self,
        iteration_id: IterationId,
        host: &HostId,
        kind: LogKind,
    ) -> StoreResult<BlobId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO log_blobs
                 (iteration_id, host_id, kind, content, size_bytes, finalized, created_at)
             VALUES (?1, ?2, ?3, x'', 0, 0, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
            params![iteration_id.value(), host.as_str(), kind.as_key()],
        )
        .map_err(|err| StoreError::Io(err.to_string()))?;
        Ok(BlobId::new(conn.last_insert_rowid()))
    }

    pub(crate) fn append_log_chunk(
        &self,
        blob_id: BlobId,
        compressed: &[u8],
        uncompressed_len: u64,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE log_blobs
                 SET content = content || ?2, size_bytes = size_bytes + ?3
                 WHERE blob_id = ?1 AND finalized = 0",
                params![blob_id.value(), compressed, uncompressed_len as i64],
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("open log blob {blob_id}")));
        }
        Ok(())
    }

    pub(crate) fn finalize_log_blob(
        &self,
        blob_id: BlobId,
        exit_code: Option<i64>,
        content_sha256: &str,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE log_blobs
                 SET finalized = 1, exit_code = ?2, content_sha256 = ?3
                 WHERE blob_id = ?1 AND finalized = 0",
                params![blob_id.value(), exit_code, content_sha256],
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("open log blob {blob_id}")));
        }
        Ok(())
    }

    pub fn log_blob(&self, blob_id: BlobId) -> StoreResult<(LogBlobRecord, Vec<u8>)> {
        let conn = self.conn()?;
        let (record, compressed): (LogBlobRecord, Vec<u8>) = conn
            .query_row(
                "SELECT blob_id, iteration_id, host_id, kind, size_bytes, content_sha256,
                        exit_code, finalized, created_at, content
                 FROM log_blobs WHERE blob_id = ?1 AND finalized = 1",
                params![blob_id.value()],
                |row| {
                    let record = map_blob_row(row)?;
                    let content: Vec<u8> = row.get(9)?;
                    Ok((record, content))
                },
            )
            .optional()
            .map_err(|err| StoreError::Io(err.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("log blob {blob_id}")))?;

        let decompressed = crate::blob::decompress(&compressed)?;
        Ok((record, decompressed))
    }

    pub fn log_blobs(&self, iteration_id: IterationId) -> StoreResult<Vec<LogBlobRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT blob_id, iteration_id, host_id, kind, size_bytes, content_sha256,
                        exit_code, finalized, created_at
                 FROM log_blobs WHERE iteration_id = ?1 AND finalized = 1
                 ORDER BY blob_id ASC",
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
        let rows = stmt
            .query_map(params![iteration_id.value()], map_blob_row)
            .map_err(|err| StoreError::Io(err.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::Io(err.to_string()))
    }

    pub fn session_log_blobs(&self, session_id: SessionId) -> StoreResult<Vec<LogBlobRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT b.blob_id, b.iteration_id, b.host_id, b.kind, b.size_bytes,
                        b.content_sha256, b.exit_code, b.finalized, b.created_at
                 FROM log_blobs b
                 JOIN iterations i ON i.iteration_id = b.iteration_id
                 WHERE i.session_id = ?1 AND b.finalized = 1
                 ORDER BY b.blob_id ASC",
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
        let rows = stmt
            .query_map(params![session_id.value()], map_blob_row)
            .map_err(|err| StoreError::Io(err.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::Io(err.to_string()))
    }

    // ---- metadata -------------------------------------------------------

    /// Store a metadata payload, content-addressed: the same payload stored
    /// twice for one session yields the same row.
    pub fn put_metadata(
        &self,
        session_id: SessionId,
        iteration_id: Option<IterationId>,
        payload: &serde_json::Value,
    ) -> StoreResult<MetadataId> {
        let rendered = payload.to_string();
        let digest = hex_digest(rendered.as_bytes());

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|err| StoreError::Io(err.to_string()))?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT metadata_id FROM metadata
                 WHERE session_id = ?1 AND content_sha256 = ?2",
                params![session_id.value(), digest],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| StoreError::Io(err.to_string()))?;

        let metadata_id = match existing {
            Some(id) => id,
            None => {
                tx.execute(
                    "INSERT INTO metadata
                         (session_id, iteration_id, content_sha256, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
                    params![
                        session_id.value(),
                        iteration_id.map(IterationId::value),
                        digest,
                        rendered,
                    ],
                )
                .map_err(|err| StoreError::Io(err.to_string()))?;
                tx.last_insert_rowid()
            }
        };
        tx.commit().map_err(|err| StoreError::Io(err.to_string()))?;
        Ok(MetadataId::new(metadata_id))
    }

    pub fn metadata(&self, metadata_id: MetadataId) -> StoreResult<MetadataRecord> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT metadata_id, session_id, iteration_id, content_sha256, payload, created_at
             FROM metadata WHERE metadata_id = ?1",
            params![metadata_id.value()],
            map_metadata_row,
        )
        .optional()
        .map_err(|err| StoreError::Io(err.to_string()))?
        .ok_or_else(|| StoreError::NotFound(format!("metadata {metadata_id}")))
    }

    pub fn metadata_for_session(&self, session_id: SessionId) -> StoreResult<Vec<MetadataRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT metadata_id, session_id, iteration_id, content_sha256, payload, created_at
                 FROM metadata WHERE session_id = ?1 ORDER BY metadata_id ASC",
            )
            .map_err(|err| StoreError::Io(err.to_string()))?;
        let rows = stmt
            .query_map(params![session_id.value()], map_metadata_row)
            .map_err(|err| StoreError::Io(err.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::Io(err.to_string()))
    }

    pub fn baseline_metadata(&self, session_id: SessionId) -> StoreResult<Option<MetadataRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT metadata_id, session_id, iteration_id, content_sha256, payload, created_at
             FROM metadata WHERE session_id = ?1 AND iteration_id IS NULL
             ORDER BY metadata_id ASC LIMIT 1",
            params![session_id.value()],
            map_metadata_row,
        )
        .optional()
        .map_err(|err| StoreError::Io(err.to_string()))
    }

    // ---- reporting ------------------------------------------------------

    pub fn summary(&self, session_id: SessionId) -> StoreResult<SessionSummary> {
        let session = self.session(session_id)?;
        let iterations = self.iterations(session_id)?;

        let mut summary = SessionSummary {
            session_id: session.session_id.value(),
            good_ref: session.good_ref,
            bad_ref: session.bad_ref,
            status: session.status.as_key().to_owned(),
            result_commit: session.result_commit,
            created_at: session.created_at,
            ended_at: session.ended_at,
            iteration_count: iterations.len() as u32,
            good_count: 0,
            bad_count: 0,
            skip_count: 0,
            pending_count: 0,
        };
        for iteration in &iterations {
            match iteration.verdict {
                IterationVerdict::Good => summary.good_count += 1,
                IterationVerdict::Bad => summary.bad_count += 1,
                IterationVerdict::Skip => summary.skip_count += 1,
                IterationVerdict::Pending => summary.pending_count += 1,
            }
        }
        Ok(summary)
    }
}

fn current_schema_version(conn: &Connection) -> StoreResult<u32> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| StoreError::Io(err.to_string()))?;
    if exists.is_none() {
        return Ok(0);
    }
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|err| StoreError::Io(err.to_string()))
}

fn apply_migration(tx: &rusqlite::Transaction<'_>, version: u32) -> StoreResult<()> {
    match version {
        1 => tx
            .execute_batch(
                "
                CREATE TABLE schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );

                CREATE TABLE sessions (
                    session_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    good_ref TEXT NOT NULL,
                    bad_ref TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    result_commit TEXT,
                    config_json TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    ended_at TEXT
                );

                CREATE TABLE hosts (
                    host_row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL,
                    hostname TEXT NOT NULL,
                    ssh_user TEXT NOT NULL,
                    kernel_path TEXT NOT NULL,
                    power_control TEXT NOT NULL,
                    test_script TEXT,
                    UNIQUE(session_id, hostname),
                    FOREIGN KEY(session_id) REFERENCES sessions(session_id)
                );

                CREATE TABLE iterations (
                    iteration_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL,
                    idx INTEGER NOT NULL,
                    commit_sha TEXT NOT NULL,
                    commit_message TEXT,
                    verdict TEXT NOT NULL DEFAULT 'pending',
                    mark_state TEXT NOT NULL DEFAULT 'none',
                    error_summary TEXT,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    UNIQUE(session_id, idx),
                    FOREIGN KEY(session_id) REFERENCES sessions(session_id)
                );

                CREATE TABLE host_outcomes (
                    iteration_id INTEGER NOT NULL,
                    host_id TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    verdict TEXT NOT NULL,
                    observed_kernel TEXT,
                    error_kind TEXT,
                    error_detail TEXT,
                    build_log_id INTEGER,
                    console_log_id INTEGER,
                    test_log_id INTEGER,
                    PRIMARY KEY (iteration_id, host_id),
                    FOREIGN KEY(iteration_id) REFERENCES iterations(iteration_id)
                );

                CREATE TABLE log_blobs (
                    blob_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    iteration_id INTEGER NOT NULL,
                    host_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    content BLOB NOT NULL,
                    size_bytes INTEGER NOT NULL DEFAULT 0,
                    content_sha256 TEXT,
                    exit_code INTEGER,
                    finalized INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    FOREIGN KEY(iteration_id) REFERENCES iterations(iteration_id)
                );

                CREATE TABLE metadata (
                    metadata_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL,
                    iteration_id INTEGER,
                    content_sha256 TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(session_id, content_sha256),
                    FOREIGN KEY(session_id) REFERENCES sessions(session_id)
                );

                CREATE INDEX idx_iterations_session ON iterations(session_id, idx);
                CREATE INDEX idx_log_blobs_iteration ON log_blobs(iteration_id);
                CREATE INDEX idx_metadata_session ON metadata(session_id);
                CREATE INDEX idx_sessions_status ON sessions(status);
                ",
            )
            .map_err(|err| StoreError::Io(err.to_string())),
        _ => Err(StoreError::Corrupt(format!(
            "no migration implementation for version {version}"
        ))),
    }
}

fn map_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status_key: String = row.get(3)?;
    Ok(SessionRecord {
        session_id: SessionId::new(row.get(0)?),
        good_ref: row.get(1)?,
        bad_ref: row.get(2)?,
        status: SessionStatus::from_key(&status_key).unwrap_or(SessionStatus::Aborted),
        result_commit: row.get(4)?,
        config_json: row.get(5)?,
        created_at: row.get(6)?,
        ended_at: row.get(7)?,
    })
}

fn map_iteration_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IterationRecord> {
    let verdict_key: String = row.get(5)?;
    let mark_key: String = row.get(6)?;
    Ok(IterationRecord {
        iteration_id: IterationId::new(row.get(0)?),
        session_id: SessionId::new(row.get(1)?),
        index: row.get(2)?,
        commit_sha: row.get(3)?,
        commit_message: row.get(4)?,
        verdict: IterationVerdict::from_key(&verdict_key).unwrap_or(IterationVerdict::Pending),
        mark_state: MarkState::from_key(&mark_key).unwrap_or(MarkState::None),
        error_summary: row.get(7)?,
        started_at: row.get(8)?,
        ended_at: row.get(9)?,
    })
}

fn map_blob_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogBlobRecord> {
    let kind_key: String = row.get(3)?;
    Ok(LogBlobRecord {
        blob_id: BlobId::new(row.get(0)?),
        iteration_id: IterationId::new(row.get(1)?),
        host: HostId::new(row.get::<_, String>(2)?),
        kind: LogKind::from_key(&kind_key).unwrap_or(LogKind::Build),
        size_bytes: row.get::<_, i64>(4)? as u64,
        content_sha256: row.get(5)?,
        exit_code: row.get(6)?,
        finalized: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
    })
}

fn map_metadata_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetadataRecord> {
    Ok(MetadataRecord {
        metadata_id: MetadataId::new(row.get(0)?),
        session_id: SessionId::new(row.get(1)?),
        iteration_id: row.get::<_, Option<i64>>(2)?.map(IterationId::new),
        content_sha256: row.get(3)?,
        payload: row.get(4)?,
        created_at: row.get(5)?,
    })
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut rendered = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(rendered, "{byte:02x}");
    }
    rendered
}
