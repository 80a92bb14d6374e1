use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Upper bound on bytes consumed per poll; the rest is picked up next tick.
const MAX_CHUNK_BYTES: u64 = 1024 * 1024;
/// A line without a newline is force-flushed once it grows past this.
const MAX_PARTIAL_BYTES: usize = 64 * 1024;

const DEFAULT_READ_LIMIT_BYTES: u64 = 64 * 1024;
const MAX_READ_LIMIT_BYTES: u64 = 1024 * 1024;

/// Incremental reader over an append-only log file.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    /// Bytes before this offset predate the tailer and are being replayed.
    replay_until: u64,
    /// Polls never read across this offset.
    checkpoint: u64,
}

impl LogTailer {
    /// Starts tailing at `offset`; pass `0` to replay the whole file.
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            partial: Vec::new(),
            replay_until: 0,
            checkpoint: 0,
        }
    }

    /// Treats everything up to `end` as history. Polls stop at that boundary
    /// until it is crossed, so a batch is either all history or all live.
    pub fn replaying_until(mut self, end: u64) -> Self {
        self.replay_until = end;
        self
    }

    /// Splits batches at `at`, so callers can tell output written before it
    /// from output written after.
    pub fn with_checkpoint(mut self, at: u64) -> Self {
        self.checkpoint = at;
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn before_checkpoint(&self) -> bool {
        self.offset < self.checkpoint
    }

    pub fn is_replaying(&self) -> bool {
        self.offset < self.replay_until
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.partial.clear();
        // The history we were replaying is gone.
        self.replay_until = 0;
        self.checkpoint = 0;
    }

    /// Reads whatever was appended since the last poll and returns the
    /// completed lines. A trailing partial line is held back.
    pub async fn poll(&mut self) -> io::Result<Vec<String>> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.reset();
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        // Truncated or replaced underneath us.
        if len < self.offset {
            self.reset();
        }
        let mut end = len;
        if self.is_replaying() {
            end = end.min(self.replay_until);
        }
        if self.before_checkpoint() {
            end = end.min(self.checkpoint);
        }
        if end == self.offset {
            return Ok(Vec::new());
        }

        let mut f = tokio::fs::File::open(&self.path).await?;
        f.seek(io::SeekFrom::Start(self.offset)).await?;
        let want = (end - self.offset).min(MAX_CHUNK_BYTES);
        let mut buf = Vec::with_capacity(want as usize);
        f.take(want).read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;

        self.partial.extend_from_slice(&buf);
        Ok(self.take_complete_lines())
    }

    /// Final read once the writer is gone; a dangling partial line is returned too.
    pub async fn drain(&mut self) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let before = self.offset;
            lines.extend(self.poll().await?);
            if self.offset == before {
                break;
            }
        }
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            lines.push(decode_line(&rest));
        }
        Ok(lines)
    }

    fn take_complete_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(end) = self.partial.iter().rposition(|b| *b == b'\n') {
            let rest = self.partial.split_off(end + 1);
            let complete = std::mem::replace(&mut self.partial, rest);
            for raw in complete[..end].split(|b| *b == b'\n') {
                lines.push(decode_line(raw));
            }
        }
        if self.partial.len() > MAX_PARTIAL_BYTES {
            let rest = std::mem::take(&mut self.partial);
            lines.push(decode_line(&rest));
        }
        lines
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    // Best-effort UTF-8: replace invalid sequences.
    String::from_utf8_lossy(raw).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LogChunk {
    pub lines: Vec<String>,
    pub next_cursor: u64,
}

/// Bounded read of a log file for callers paging through history.
///
/// Cursor `0` returns the tail of the file (at most `limit_bytes`); any other
/// cursor is a byte offset to continue reading forward from.
pub async fn read_log(path: &Path, cursor: u64, limit_bytes: u64) -> io::Result<LogChunk> {
    let size = match tokio::fs::metadata(path).await {
        Ok(m) => m.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(LogChunk {
                lines: Vec::new(),
                next_cursor: 0,
            });
        }
        Err(e) => return Err(e),
    };

    let limit = if limit_bytes == 0 {
        DEFAULT_READ_LIMIT_BYTES
    } else {
        limit_bytes.min(MAX_READ_LIMIT_BYTES)
    };

    let mut start = if cursor == 0 {
        size.saturating_sub(limit)
    } else {
        cursor.min(size)
    };

    let mut f = tokio::fs::File::open(path).await?;
    f.seek(io::SeekFrom::Start(start)).await?;
    let mut buf = Vec::new();
    f.take(limit.min(size - start)).read_to_end(&mut buf).await?;

    // A tail read usually lands mid-line; skip to the next line start.
    if cursor == 0
        && start > 0
        && let Some(nl) = buf.iter().position(|b| *b == b'\n')
    {
        buf.drain(..=nl);
        start += nl as u64 + 1;
    }

    // Only hand out whole lines so the cursor never splits one.
    let consumed = match buf.iter().rposition(|b| *b == b'\n') {
        Some(end) => end + 1,
        // One line longer than the limit: hand it out in pieces.
        None if buf.len() as u64 >= limit => buf.len(),
        None => 0,
    };
    let lines = buf[..consumed]
        .split(|b| *b == b'\n')
        .filter(|l| !l.is_empty())
        .map(decode_line)
        .collect();

    Ok(LogChunk {
        lines,
        next_cursor: start + consumed as u64,
    })
}
