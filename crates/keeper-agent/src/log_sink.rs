use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

/// The append-only file a child's stdout and stderr are redirected into.
///
/// The child writes to the file directly, so output keeps landing there after
/// the supervisor exits and an adopted process can be tailed later.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: File,
    /// File length before the new process wrote anything.
    start_offset: u64,
}

impl LogSink {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let start_offset = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            start_offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Returns `(stdout, stderr)`, both sharing one append-mode file description.
    pub fn stdio(&self) -> io::Result<(Stdio, Stdio)> {
        let out = self.file.try_clone()?;
        let err = self.file.try_clone()?;
        Ok((Stdio::from(out), Stdio::from(err)))
    }
}
