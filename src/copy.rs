//! Bounded, line-framed stream copy.
//!
//! Copies a byte stream to a destination while enforcing a maximum size,
//! framing the stream into `\n`-terminated lines and invoking a per-line
//! validation callback. Line 1 is parsed to populate the header map that
//! later lines' findings resolve column names against; the callback still
//! sees line 1 so whole-file checks (encoding, structure) can run there.
//!
//! What happens to an invalid line is decided by the process-wide
//! [`ValidationMode`]: fail the whole copy, skip the line with a warning, or
//! write it anyway with a warning. A callback error of
//! [`CopyError::InvalidBuffer`] aborts immediately regardless of mode.

use std::collections::HashMap;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::config;
use crate::validators::{self, EncodingError, StructureError, ValidationIssue, ValidationMode};

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("max file size exceeded")]
    MaxFileSizeExceeded,
    #[error("buffer validation failed: detected suspicious content")]
    InvalidBuffer,
    #[error("invalid encoding: {0}")]
    Encoding(#[from] EncodingError),
    #[error("invalid CSV structure: {0}")]
    Structure(String),
    #[error("CSV validation error: {0}")]
    Csv(#[from] StructureError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Verdict of the per-line validation callback.
///
/// Mirrors the three independent outputs a validator can produce: a pass/fail
/// flag, a structured issue describing the finding, and a fatal error that
/// overrides the validation mode.
pub struct LineCheck {
    pub ok: bool,
    pub issue: Option<ValidationIssue>,
    pub error: Option<CopyError>,
}

impl LineCheck {
    pub fn pass() -> Self {
        LineCheck { ok: true, issue: None, error: None }
    }

    pub fn invalid(issue: ValidationIssue) -> Self {
        LineCheck { ok: false, issue: Some(issue), error: None }
    }

    pub fn fatal(error: CopyError) -> Self {
        LineCheck { ok: false, issue: None, error: Some(error) }
    }

    pub fn fatal_with(error: CopyError, issue: ValidationIssue) -> Self {
        LineCheck { ok: false, issue: Some(issue), error: Some(error) }
    }
}

/// Successful copy summary.
#[derive(Debug, Default)]
pub struct CopyReport {
    pub bytes_written: u64,
    /// Most recent validation issue observed (also set on warned lines).
    pub issue: Option<ValidationIssue>,
    pub warnings: Vec<String>,
}

/// Failed copy: the error plus whatever state had accumulated.
#[derive(Debug)]
pub struct CopyFailure {
    pub error: CopyError,
    pub issue: Option<ValidationIssue>,
    pub bytes_written: u64,
}

/// Line-framed copier that can be driven chunk by chunk.
pub struct BoundedCopier<W, V> {
    dst: W,
    validator: Option<V>,
    mode: ValidationMode,
    max_size: u64,
    pending: Vec<u8>,
    header_map: HashMap<usize, String>,
    current_line: u64,
    written: u64,
    issue: Option<ValidationIssue>,
    warnings: Vec<String>,
}

impl<W, V> BoundedCopier<W, V>
where
    W: AsyncWrite + Unpin,
    V: FnMut(&[u8], u64, &HashMap<usize, String>) -> LineCheck,
{
    /// `max_size` of `None` reads `ENV_MAX_FILE_SIZE` (default 2 GiB).
    pub fn new(dst: W, validator: Option<V>, max_size: Option<u64>, mode: ValidationMode) -> Self {
        BoundedCopier {
            dst,
            validator,
            mode,
            max_size: max_size.unwrap_or_else(config::max_file_size),
            pending: Vec::new(),
            header_map: HashMap::new(),
            current_line: 0,
            written: 0,
            issue: None,
            warnings: Vec::new(),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Feed a chunk; drains every complete line it contains.
    pub async fn push(&mut self, chunk: &[u8]) -> Result<(), CopyError> {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.handle_line(&line).await?;
        }
        Ok(())
    }

    /// Process the trailing partial line (if any) and flush the destination.
    pub async fn finish(&mut self) -> Result<(), CopyError> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.handle_line(&line).await?;
        }
        self.dst.flush().await?;
        if !self.warnings.is_empty() {
            info!(count = self.warnings.len(), "copy completed with validation warnings");
        }
        Ok(())
    }

    pub fn into_report(self) -> CopyReport {
        CopyReport {
            bytes_written: self.written,
            issue: self.issue,
            warnings: self.warnings,
        }
    }

    pub fn failure(self, error: CopyError) -> CopyFailure {
        CopyFailure {
            error,
            issue: self.issue,
            bytes_written: self.written,
        }
    }

    async fn handle_line(&mut self, line: &[u8]) -> Result<(), CopyError> {
        if line.is_empty() {
            return Ok(());
        }
        self.current_line += 1;

        if self.current_line == 1 {
            for (i, name) in validators::split_csv_line(line).into_iter().enumerate() {
                self.header_map.insert(i, name.trim_matches('"').to_string());
            }
        }

        if self.check_line(line)? {
            return Ok(());
        }
        self.write_line(line).await
    }

    /// Runs the validator and applies the validation mode. Returns `true`
    /// when the line must be skipped.
    fn check_line(&mut self, line: &[u8]) -> Result<bool, CopyError> {
        let Some(validator) = self.validator.as_mut() else {
            return Ok(false);
        };

        let check = validator(line, self.current_line, &self.header_map);
        if let Some(issue) = check.issue {
            self.issue = Some(issue);
        }

        if let Some(error) = check.error {
            if matches!(error, CopyError::InvalidBuffer) {
                return Err(error);
            }
            if self.mode == ValidationMode::RejectFile {
                return Err(error);
            }
            warn!(line = self.current_line, error = %error, "line validation error, continuing");
            self.warnings.push(format!("validation error: {error}"));
            return Ok(false);
        }

        if check.ok {
            return Ok(false);
        }

        let (line_no, column) = self
            .issue
            .as_ref()
            .map(|i| (i.line, i.column.clone()))
            .unwrap_or((self.current_line, String::new()));

        match self.mode {
            ValidationMode::RejectFile => Err(CopyError::InvalidBuffer),
            ValidationMode::RejectRow => {
                warn!(line = line_no, column = %column, "skipping invalid line");
                self.warnings
                    .push(format!("skipped invalid line {line_no}, column {column}"));
                Ok(true)
            }
            ValidationMode::Ignore => {
                warn!(line = line_no, column = %column, "ignoring suspicious line");
                self.warnings
                    .push(format!("ignored suspicious patterns: line {line_no}, column {column}"));
                Ok(false)
            }
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<(), CopyError> {
        self.dst.write_all(line).await?;
        self.written += line.len() as u64;
        if self.written > self.max_size {
            return Err(CopyError::MaxFileSizeExceeded);
        }
        Ok(())
    }
}

/// Copy `src` to `dst` with a caller-chosen buffer, enforcing the size cap
/// and validating each line.
///
/// `max_size` of `None` reads `ENV_MAX_FILE_SIZE` on this call; the buffer
/// size should come from `config::copy_buffer_size()` unless the caller has
/// a reason to pick its own.
pub async fn copy_with_limit<R, W, V>(
    src: &mut R,
    dst: W,
    buffer_size: usize,
    max_size: Option<u64>,
    mode: ValidationMode,
    validator: Option<V>,
) -> Result<CopyReport, CopyFailure>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    V: FnMut(&[u8], u64, &HashMap<usize, String>) -> LineCheck,
{
    let mut copier = BoundedCopier::new(dst, validator, max_size, mode);
    let mut buffer = vec![0u8; buffer_size.max(1)];

    loop {
        let n = match src.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return Err(copier.failure(CopyError::Io(e))),
        };
        if let Err(e) = copier.push(&buffer[..n]).await {
            return Err(copier.failure(e));
        }
    }

    if let Err(e) = copier.finish().await {
        return Err(copier.failure(e));
    }
    Ok(copier.into_report())
}
