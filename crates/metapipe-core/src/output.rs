//! Output writers: one aggregate JSON document or JSON Lines.
//!
//! File destinations are always written through a temp file in the target
//! directory and renamed into place, so an aborted run leaves nothing behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};
use tempfile::NamedTempFile;

use crate::config::OutputConfig;
use crate::diff::DiffReport;
use crate::domain::error::Result;
use crate::domain::stage::StageError;
use crate::envelope::{OutputItem, ResultEnvelope, RunMeta};

fn staging_file(path: &Path) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    Ok(NamedTempFile::new_in(dir)?)
}

/// Serialize the aggregate envelope.
pub fn render_envelope(envelope: &ResultEnvelope, pretty: bool) -> Result<Vec<u8>> {
    let mut out = if pretty {
        serde_json::to_vec_pretty(envelope)?
    } else {
        serde_json::to_vec(envelope)?
    };
    out.push(b'\n');
    Ok(out)
}

/// Write the aggregate envelope to the configured destination.
pub fn write_envelope(envelope: &ResultEnvelope, config: &OutputConfig) -> Result<()> {
    let bytes = render_envelope(envelope, config.pretty)?;
    match &config.path {
        Some(path) => {
            let mut tmp = staging_file(path)?;
            tmp.write_all(&bytes)?;
            tmp.persist(path).map_err(|e| e.error)?;
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            lock.write_all(&bytes)?;
            lock.flush()?;
        }
    }
    Ok(())
}

/// JSON Lines destination.
pub enum LineSink {
    /// Lines go straight to stdout.
    Direct(Box<dyn Write + Send>),
    /// Lines go to a temp file that is renamed onto `path` on success.
    Staged { tmp: NamedTempFile, path: PathBuf },
    /// Lines are held until the run completes (stdout under fail-fast).
    Buffered(Vec<u8>),
}

impl std::fmt::Debug for LineSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineSink::Direct(_) => f.write_str("LineSink::Direct"),
            LineSink::Staged { path, .. } => write!(f, "LineSink::Staged({})", path.display()),
            LineSink::Buffered(buf) => write!(f, "LineSink::Buffered({} bytes)", buf.len()),
        }
    }
}

impl LineSink {
    /// Pick the sink for `config`; `hold_stdout` buffers stdout until the end.
    pub fn open(config: &OutputConfig, hold_stdout: bool) -> Result<Self> {
        Ok(match &config.path {
            Some(path) => LineSink::Staged {
                tmp: staging_file(path)?,
                path: path.clone(),
            },
            None if hold_stdout => LineSink::Buffered(Vec::new()),
            None => LineSink::Direct(Box::new(io::stdout())),
        })
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            LineSink::Direct(w) => w.as_mut(),
            LineSink::Staged { tmp, .. } => tmp.as_file_mut(),
            LineSink::Buffered(buf) => buf,
        }
    }

    fn line<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let mut bytes = serde_json::to_vec(value)?;
        bytes.push(b'\n');
        self.writer().write_all(&bytes)?;
        Ok(())
    }

    /// Emit one record line.
    pub fn record(&mut self, item: &OutputItem) -> Result<()> {
        self.line(item)
    }

    /// Emit the trailing lines and publish the output.
    ///
    /// `errors` must already be in canonical order.
    pub fn finish(
        mut self,
        errors: &[StageError],
        reduce: Option<&Value>,
        diff: Option<&DiffReport>,
        meta: &RunMeta,
    ) -> Result<()> {
        for error in errors {
            self.line(&json!({ "error": error }))?;
        }
        if let Some(reduce) = reduce {
            self.line(&json!({ "reduce": reduce }))?;
        }
        if let Some(diff) = diff {
            self.line(&json!({ "diff": diff }))?;
        }
        self.line(&json!({ "meta": meta }))?;

        match self {
            LineSink::Direct(mut w) => w.flush()?,
            LineSink::Staged { mut tmp, path } => {
                tmp.flush()?;
                tmp.persist(&path).map_err(|e| e.error)?;
            }
            LineSink::Buffered(buf) => {
                let stdout = io::stdout();
                let mut lock = stdout.lock();
                lock.write_all(&buf)?;
                lock.flush()?;
            }
        }
        Ok(())
    }

    /// Drop everything written so far; the destination is left untouched.
    pub fn discard(self) {
        if let LineSink::Staged { tmp, .. } = self {
            let _ = tmp.close();
        }
    }
}
