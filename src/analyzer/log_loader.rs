//! Sequential reading of a recorded experiment log.
//!
//! A log is read exactly once from start to end: first the header block
//! (up to the `----` sentinel), then the body line by line.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::log_parser::parse_log_line;
use crate::common::{AnalysisError, AnalysisResult, ExperimentMeta, HEADER_SENTINEL};

/// Buffer size for reading log files (8KB).
const BUFFER_SIZE: usize = 8 * 1024;

/// Log file loader holding the single open read handle.
pub struct LogLoader<R = BufReader<File>> {
    reader: R,
    path: PathBuf,
    eof_reached: bool,
    line_buffer: String,
    /// Body line met while still looking for the header sentinel.
    pending: Option<String>,
}

impl LogLoader {
    /// Open a log file.
    ///
    /// # Returns
    ///
    /// `Ok(LogLoader)` if the file opens successfully, `AnalysisError::Io` otherwise.
    pub fn open(path: &Path) -> AnalysisResult<Self> {
        let file = File::open(path).map_err(|e| AnalysisError::io(path, e))?;
        Ok(Self::from_reader(BufReader::with_capacity(BUFFER_SIZE, file), path))
    }
}

impl<R: BufRead> LogLoader<R> {
    pub fn from_reader(reader: R, path: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            path: path.into(),
            eof_reached: false,
            line_buffer: String::with_capacity(512),
            pending: None,
        }
    }

    /// Consume the header and parse it into experiment metadata.
    ///
    /// A log without sentinel ends its header at the first body line.
    pub fn read_header(&mut self) -> AnalysisResult<ExperimentMeta> {
        let mut header = Vec::new();
        while let Some(line) = self.read_raw()? {
            if line == HEADER_SENTINEL {
                break;
            }
            if parse_log_line(&line).is_some() {
                log::warn!("{}: header not terminated by '{}'", self.path.display(), HEADER_SENTINEL);
                self.pending = Some(line);
                break;
            }
            header.push(line);
        }
        ExperimentMeta::from_header(header.iter().map(String::as_str))
    }

    /// Next non-empty body line, `None` at EOF.
    pub fn next_line(&mut self) -> AnalysisResult<Option<String>> {
        if let Some(line) = self.pending.take() {
            return Ok(Some(line));
        }
        loop {
            match self.read_raw()? {
                Some(line) if line.is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    fn read_raw(&mut self) -> AnalysisResult<Option<String>> {
        if self.eof_reached {
            return Ok(None);
        }
        self.line_buffer.clear();
        match self.reader.read_line(&mut self.line_buffer) {
            Ok(0) => {
                self.eof_reached = true;
                Ok(None)
            }
            Ok(_) => Ok(Some(self.line_buffer.trim_end().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                log::warn!("{}: skipping line with invalid UTF-8", self.path.display());
                Ok(Some(String::new()))
            }
            Err(e) => Err(AnalysisError::io(&self.path, e)),
        }
    }

    /// Check if EOF has been reached.
    pub fn is_eof(&self) -> bool {
        self.eof_reached
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
