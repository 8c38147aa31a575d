//! Append-only output file with an embedded progress marker.
//!
//! Each output file is a UTF-8 log of one translated row per line. While
//! a run is in flight, the file's final line is a machine-readable
//! marker `"{page},{cumulative_rows}"` recording the last durably
//! written page. Removing the marker is the single act that declares
//! the file published.
//!
//! ## Crash model
//!
//! An append replaces the trailing marker with the new lines and a new
//! marker in one buffered write, flushed and synced before return. A
//! crash mid-append leaves either the previous marker as the last line
//! (nothing flushed) or a ragged tail after the previous marker. The
//! next append repairs the tail: it locates the last marker whose row
//! count matches its position in the file (a marker claims exactly the
//! number of lines above it, so ragged data cannot impersonate one)
//! and discards everything after it before writing.
//!
//! ## Within-process exclusion
//!
//! A sibling `<file>.lock` created with exclusive-create serialises
//! concurrent appends from one process. Lock files older than a
//! configurable threshold are reclaimed, so a crashed thread cannot
//! wedge the file forever. Cross-replica exclusion is the lease's job,
//! not the lock file's.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};

use nightjar_core::FileId;

use crate::error::{Error, Result};

/// Default age after which an abandoned lock file is reclaimed.
pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(300);

/// Delay between lock acquisition attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Maximum lock acquisition attempts before giving up.
const LOCK_MAX_ATTEMPTS: u32 = 100;

/// How many trailing bytes are inspected to find the final line.
const TAIL_WINDOW: u64 = 64 * 1024;

/// The trailing progress marker of an in-flight output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// The last page durably written to the file.
    pub page: u64,
    /// Total rows written through that page.
    pub cumulative_rows: u64,
}

impl Footer {
    /// Parses a marker line (without line terminator).
    ///
    /// Accepts exactly `"{digits},{digits}"`; anything else is a data
    /// line, not a marker.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let (page, rows) = line.split_once(',')?;
        if page.is_empty()
            || rows.is_empty()
            || !page.bytes().all(|b| b.is_ascii_digit())
            || !rows.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        Some(Self {
            page: page.parse().ok()?,
            cumulative_rows: rows.parse().ok()?,
        })
    }

    fn render(&self) -> String {
        format!("{},{}\n", self.page, self.cumulative_rows)
    }
}

/// Result of one append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The page and a fresh marker were written and synced.
    Appended,
    /// The marker already covers this page; nothing was modified.
    SkippedStale,
}

/// Durable tail state: the governing marker, if any, and the offset at
/// which the next write begins (the marker's first byte when present).
#[derive(Debug, Clone, Copy)]
struct TailState {
    footer: Option<Footer>,
    write_at: u64,
}

/// Writer over one append-only output file.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    file_id: FileId,
    path: PathBuf,
    stale_lock_after: Duration,
}

impl OutputWriter {
    /// Creates a writer for the given output path.
    #[must_use]
    pub fn new(file_id: FileId, path: impl Into<PathBuf>) -> Self {
        Self {
            file_id,
            path: path.into(),
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
        }
    }

    /// Overrides the stale-lock reclaim threshold.
    #[must_use]
    pub const fn with_stale_lock_after(mut self, threshold: Duration) -> Self {
        self.stale_lock_after = threshold;
        self
    }

    /// The output path this writer appends to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The output file identity, used in error context.
    #[must_use]
    pub const fn file_id(&self) -> &FileId {
        &self.file_id
    }

    /// Appends one page of lines and a fresh marker.
    ///
    /// If the governing marker already records `page` (or a later
    /// page), the call is a no-op, so retried and duplicate attempts
    /// are safe. Otherwise the previous marker and any ragged crash tail
    /// are replaced by the new lines and the new marker
    /// `"{page},{cumulative_rows}"` in a single write that is flushed
    /// and synced before return.
    ///
    /// Line terminators are normalised: each entry becomes exactly one
    /// `\n`-terminated line, with interior terminators collapsed.
    ///
    /// Must not be called on a finalized (marker-free) file; the
    /// orchestrator guards this via the progress store's status.
    ///
    /// # Errors
    ///
    /// Returns a write error if the lock cannot be acquired or any file
    /// operation fails.
    pub async fn append_page(
        &self,
        page: u64,
        cumulative_rows: u64,
        lines: &[String],
    ) -> Result<AppendOutcome> {
        let _lock = self.acquire_lock().await?;

        let tail = self.current_tail().await?;
        if let Some(footer) = tail.footer {
            if footer.page >= page {
                return Ok(AppendOutcome::SkippedStale);
            }
        }

        let mut buffer = String::new();
        for line in lines {
            buffer.push_str(&normalize_line(line));
            buffer.push('\n');
        }
        buffer.push_str(
            &Footer {
                page,
                cumulative_rows,
            }
            .render(),
        );

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(|e| self.io_err("open for append", e))?;

        file.seek(SeekFrom::Start(tail.write_at))
            .await
            .map_err(|e| self.io_err("seek to marker", e))?;
        file.write_all(buffer.as_bytes())
            .await
            .map_err(|e| self.io_err("write page", e))?;
        file.set_len(tail.write_at + buffer.len() as u64)
            .await
            .map_err(|e| self.io_err("trim stale tail", e))?;
        file.sync_all()
            .await
            .map_err(|e| self.io_err("sync page", e))?;

        Ok(AppendOutcome::Appended)
    }

    /// Removes the trailing marker, declaring the file published.
    ///
    /// Idempotent: a file without a trailing marker (already finalized,
    /// or never written) is left untouched. A file containing only a
    /// marker is deleted.
    ///
    /// # Errors
    ///
    /// Returns a write error if the lock cannot be acquired or the
    /// truncation fails.
    pub async fn remove_footer(&self) -> Result<()> {
        let _lock = self.acquire_lock().await?;

        let tail = read_trailing(&self.path)
            .await
            .map_err(|e| self.io_err("inspect tail", e))?;
        if tail.footer.is_none() {
            return Ok(());
        }

        if tail.write_at == 0 {
            fs::remove_file(&self.path)
                .await
                .map_err(|e| self.io_err("remove marker-only file", e))?;
            return Ok(());
        }

        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_err("open for finalize", e))?;
        file.set_len(tail.write_at)
            .await
            .map_err(|e| self.io_err("truncate marker", e))?;
        file.sync_all()
            .await
            .map_err(|e| self.io_err("sync finalize", e))?;

        Ok(())
    }

    /// Reads the marker of an output file, `(0, 0)` when the file is
    /// missing, empty, or its final line is not a marker.
    pub async fn read_footer(path: &Path) -> (u64, u64) {
        match read_trailing(path).await {
            Ok(tail) => tail
                .footer
                .map_or((0, 0), |f| (f.page, f.cumulative_rows)),
            Err(_) => (0, 0),
        }
    }

    /// Determines the governing tail state, repairing after a crash.
    ///
    /// Fast path: the final line is a valid marker. Otherwise a full
    /// scan locates the last position-verified marker and everything
    /// after it is treated as a ragged tail to overwrite.
    async fn current_tail(&self) -> Result<TailState> {
        let trailing = read_trailing(&self.path)
            .await
            .map_err(|e| self.io_err("inspect tail", e))?;

        if trailing.footer.is_some() || trailing.write_at == 0 {
            return Ok(trailing);
        }

        let recovered = recover_scan(&self.path)
            .await
            .map_err(|e| self.io_err("recover tail", e))?;
        if recovered.footer.is_some() {
            tracing::warn!(
                file_id = %self.file_id,
                path = %self.path.display(),
                "repaired ragged tail after interrupted append"
            );
        }
        Ok(recovered)
    }

    fn io_err(&self, context: &str, source: std::io::Error) -> Error {
        Error::write_io(
            self.file_id.clone(),
            format!("{context} ({})", self.path.display()),
            source,
        )
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map_or_else(|| "output".into(), std::ffi::OsStr::to_os_string);
        name.push(".lock");
        self.path.with_file_name(name)
    }

    async fn acquire_lock(&self) -> Result<LockGuard> {
        let lock_path = self.lock_path();

        for _ in 0..LOCK_MAX_ATTEMPTS {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(_) => return Ok(LockGuard { path: lock_path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.reclaim_if_stale(&lock_path).await {
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => return Err(self.io_err("create lock file", e)),
            }
        }

        Err(Error::Write {
            file_id: self.file_id.clone(),
            message: format!("lock file busy: {}", lock_path.display()),
            source: None,
        })
    }

    /// Removes the lock file when it is older than the stale threshold.
    async fn reclaim_if_stale(&self, lock_path: &Path) -> bool {
        let Ok(meta) = fs::metadata(lock_path).await else {
            // Holder released between our attempts.
            return true;
        };
        let stale = meta
            .modified()
            .ok()
            .and_then(|at| at.elapsed().ok())
            .is_some_and(|age| age > self.stale_lock_after);

        if stale {
            tracing::warn!(path = %lock_path.display(), "reclaiming stale output lock");
            let _ = fs::remove_file(lock_path).await;
        }
        stale
    }
}

/// Guard for a held output lock; removes the lock file on drop.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Collapses interior line terminators so one row stays one line.
fn normalize_line(line: &str) -> String {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.contains(['\r', '\n']) {
        trimmed.replace(['\r', '\n'], " ")
    } else {
        trimmed.to_string()
    }
}

/// Interprets only the final line of the file.
///
/// Returns the marker when the final line parses as one; otherwise no
/// footer and `write_at` at end of file (fresh or finalized content).
async fn read_trailing(path: &Path) -> std::io::Result<TailState> {
    let meta = match fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(TailState {
                footer: None,
                write_at: 0,
            });
        }
        Err(e) => return Err(e),
    };

    let len = meta.len();
    if len == 0 {
        return Ok(TailState {
            footer: None,
            write_at: 0,
        });
    }

    let window_start = len.saturating_sub(TAIL_WINDOW);
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(window_start)).await?;
    let mut window = Vec::with_capacity(usize::try_from(len - window_start).unwrap_or(0));
    file.read_to_end(&mut window).await?;

    if window.last() != Some(&b'\n') {
        // Ragged final line from an interrupted append.
        return Ok(TailState {
            footer: None,
            write_at: len,
        });
    }

    let body = &window[..window.len() - 1];
    let line_start = body
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);

    let footer = std::str::from_utf8(&body[line_start..])
        .ok()
        .and_then(Footer::parse);

    Ok(match footer {
        Some(footer) => TailState {
            footer: Some(footer),
            write_at: window_start + line_start as u64,
        },
        None => TailState {
            footer: None,
            write_at: len,
        },
    })
}

/// Full forward scan locating the last position-verified marker.
///
/// A genuine marker claims exactly the number of lines above itself, so
/// a data line that merely looks like `"{digits},{digits}"` is rejected
/// unless its row count coincides with its own position. Everything
/// after the found marker is a ragged tail to be overwritten. With no
/// verified marker anywhere, no page ever completed and the interrupted
/// first append restarts from an empty file.
async fn recover_scan(path: &Path) -> std::io::Result<TailState> {
    let file = fs::File::open(path).await?;
    let mut reader = BufReader::new(file);

    let mut offset: u64 = 0;
    let mut line_index: u64 = 0;
    let mut best: Option<TailState> = None;
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            break;
        }

        if line.ends_with('\n') {
            if let Some(footer) = Footer::parse(line.trim_end_matches('\n')) {
                if footer.cumulative_rows == line_index {
                    best = Some(TailState {
                        footer: Some(footer),
                        write_at: offset,
                    });
                }
            }
        }

        offset += read as u64;
        line_index += 1;
    }

    Ok(best.unwrap_or(TailState {
        footer: None,
        write_at: 0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(dir: &tempfile::TempDir, name: &str) -> OutputWriter {
        OutputWriter::new(
            FileId::new(name).expect("valid"),
            dir.path().join(format!("{name}.out")),
        )
    }

    fn lines(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    async fn contents(writer: &OutputWriter) -> String {
        fs::read_to_string(writer.path()).await.expect("readable")
    }

    #[test]
    fn footer_parse_accepts_markers_only() {
        assert_eq!(
            Footer::parse("3,42"),
            Some(Footer {
                page: 3,
                cumulative_rows: 42
            })
        );
        assert_eq!(
            Footer::parse("0,0"),
            Some(Footer {
                page: 0,
                cumulative_rows: 0
            })
        );

        assert_eq!(Footer::parse(""), None);
        assert_eq!(Footer::parse("3"), None);
        assert_eq!(Footer::parse("3,"), None);
        assert_eq!(Footer::parse(",42"), None);
        assert_eq!(Footer::parse("3,42,7"), None);
        assert_eq!(Footer::parse("-3,42"), None);
        assert_eq!(Footer::parse("3, 42"), None);
        assert_eq!(Footer::parse("a,b"), None);
    }

    #[tokio::test]
    async fn append_writes_lines_and_marker() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir, "a");

        let outcome = writer.append_page(0, 3, &lines(&["r1", "r2", "r3"])).await?;
        assert_eq!(outcome, AppendOutcome::Appended);
        assert_eq!(contents(&writer).await, "r1\nr2\nr3\n0,3\n");

        Ok(())
    }

    #[tokio::test]
    async fn append_replaces_previous_marker() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir, "a");

        writer.append_page(0, 3, &lines(&["r1", "r2", "r3"])).await?;
        writer.append_page(1, 5, &lines(&["r4", "r5"])).await?;

        assert_eq!(contents(&writer).await, "r1\nr2\nr3\nr4\nr5\n1,5\n");
        assert_eq!(OutputWriter::read_footer(writer.path()).await, (1, 5));

        Ok(())
    }

    #[tokio::test]
    async fn stale_append_is_a_no_op() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir, "a");

        writer.append_page(0, 3, &lines(&["r1", "r2", "r3"])).await?;
        writer.append_page(1, 5, &lines(&["r4", "r5"])).await?;
        let before = contents(&writer).await;

        // A retried or duplicate attempt for an already-covered page.
        let outcome = writer.append_page(1, 5, &lines(&["r4", "r5"])).await?;
        assert_eq!(outcome, AppendOutcome::SkippedStale);

        let outcome = writer.append_page(0, 3, &lines(&["zz"])).await?;
        assert_eq!(outcome, AppendOutcome::SkippedStale);

        assert_eq!(contents(&writer).await, before);

        Ok(())
    }

    #[tokio::test]
    async fn remove_footer_truncates_marker_only() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir, "a");

        writer.append_page(0, 2, &lines(&["r1", "r2"])).await?;
        writer.remove_footer().await?;

        assert_eq!(contents(&writer).await, "r1\nr2\n");

        // A second removal is a no-op; data lines are never stripped.
        writer.remove_footer().await?;
        assert_eq!(contents(&writer).await, "r1\nr2\n");

        Ok(())
    }

    #[tokio::test]
    async fn remove_footer_deletes_marker_only_file() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir, "a");

        writer.append_page(0, 0, &[]).await?;
        assert_eq!(contents(&writer).await, "0,0\n");

        writer.remove_footer().await?;
        assert!(fs::metadata(writer.path()).await.is_err());

        // And removal on a missing file stays a no-op.
        writer.remove_footer().await?;

        Ok(())
    }

    #[tokio::test]
    async fn ragged_tail_is_repaired_before_append() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir, "a");

        writer.append_page(0, 2, &lines(&["r1", "r2"])).await?;

        // Simulate a crash that flushed part of the next append after
        // the durable marker: one complete line and one ragged line.
        let mut raw = fs::read(writer.path()).await.expect("read");
        raw.extend_from_slice(b"r3\nr4 partial");
        fs::write(writer.path(), &raw).await.expect("write");

        let outcome = writer.append_page(1, 4, &lines(&["r3", "r4"])).await?;
        assert_eq!(outcome, AppendOutcome::Appended);
        assert_eq!(contents(&writer).await, "r1\nr2\nr3\nr4\n1,4\n");

        Ok(())
    }

    #[tokio::test]
    async fn ragged_tail_repair_rejects_lookalike_markers() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir, "a");

        writer.append_page(0, 2, &lines(&["r1", "r2"])).await?;

        // The ragged tail contains a data line shaped like a marker,
        // but its claimed row count does not match its position.
        let mut raw = fs::read(writer.path()).await.expect("read");
        raw.extend_from_slice(b"7,9\npartial");
        fs::write(writer.path(), &raw).await.expect("write");

        writer.append_page(1, 4, &lines(&["x", "y"])).await?;
        assert_eq!(contents(&writer).await, "r1\nr2\nx\ny\n1,4\n");

        Ok(())
    }

    #[tokio::test]
    async fn ragged_first_append_restarts_from_empty() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir, "a");

        // Crash during the very first append: lines but no marker yet.
        fs::write(writer.path(), b"r1\nr2 part").await.expect("write");

        writer.append_page(0, 2, &lines(&["r1", "r2"])).await?;
        assert_eq!(contents(&writer).await, "r1\nr2\n0,2\n");

        Ok(())
    }

    #[tokio::test]
    async fn interior_newlines_are_collapsed() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir, "a");

        writer
            .append_page(0, 2, &lines(&["bad\nrow", "crlf\r\n"]))
            .await?;
        assert_eq!(contents(&writer).await, "bad row\ncrlf\n0,2\n");

        Ok(())
    }

    #[tokio::test]
    async fn read_footer_defaults_for_odd_files() {
        let dir = tempfile::tempdir().expect("tempdir");

        // Missing file.
        assert_eq!(
            OutputWriter::read_footer(&dir.path().join("missing.out")).await,
            (0, 0)
        );

        // Empty file.
        let empty = dir.path().join("empty.out");
        fs::write(&empty, b"").await.expect("write");
        assert_eq!(OutputWriter::read_footer(&empty).await, (0, 0));

        // Finalized file: last line is data, not a marker.
        let plain = dir.path().join("plain.out");
        fs::write(&plain, b"r1\nr2\n").await.expect("write");
        assert_eq!(OutputWriter::read_footer(&plain).await, (0, 0));
    }

    #[tokio::test]
    async fn concurrent_appends_serialise_per_file() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = std::sync::Arc::new(writer(&dir, "a"));

        writer.append_page(0, 1, &lines(&["r1"])).await?;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                writer.append_page(1, 2, &lines(&["r2"])).await
            }));
        }

        let mut appended = 0;
        for handle in handles {
            if handle.await.expect("join")? == AppendOutcome::Appended {
                appended += 1;
            }
        }

        // Exactly one attempt wrote page 1; the rest saw the fresh marker.
        assert_eq!(appended, 1);
        assert_eq!(contents(&writer).await, "r1\nr2\n1,2\n");

        Ok(())
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir, "a").with_stale_lock_after(Duration::from_millis(10));

        // A leftover lock from a crashed thread.
        let lock_path = dir.path().join("a.out.lock");
        fs::write(&lock_path, b"").await.expect("write lock");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = writer.append_page(0, 1, &lines(&["r1"])).await?;
        assert_eq!(outcome, AppendOutcome::Appended);
        assert!(fs::metadata(&lock_path).await.is_err());

        Ok(())
    }
}
