//! CSV ingestion pipeline.
//!
//! Orchestrates the path from an uploaded file to a queryable table:
//!
//! 1. Reject unsupported declared encodings.
//! 2. Open the spooled upload.
//! 3. Sniff the MIME type from content (skipped for `test*` filenames and
//!    empty files); non-CSV text must at least parse as a two-column sample.
//! 4. Create the upload temp file under the process temp directory.
//! 5. Stream through the bounded copier: line 1 runs encoding + structure
//!    validation against the sampled head, every data line runs the
//!    injection screen.
//! 6. Without `override`, an existing table fails the upload.
//! 7. `CREATE TABLE ... AS SELECT * FROM read_csv(...)`.
//! 8. Fetch column metadata, 9. row count, 10. delete the temp file.
//!
//! Every step has its own error code; step 10 failures are logged only. A
//! successful create never rolls back on later metadata failures — the table
//! stays queryable.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tracing::{info, warn};

use crate::config;
use crate::copy::{self, CopyError, LineCheck};
use crate::db::{self, Database};
use crate::error::{ErrorCode, UploadError};
use crate::validators::{self, ValidationMode};

/// Bytes of the file head used for MIME, encoding, and structure checks.
const SAMPLE_BYTES: usize = 32 * 1024;

/// MIME types accepted for CSV uploads without a structural check.
const ALLOWED_MIME_TYPES: &[&str] = &[
    "text/csv",
    "text/plain",
    "application/csv",
    "text/comma-separated-values",
    "application/vnd.ms-excel",
];

/// Parameters of one upload.
#[derive(Debug)]
pub struct CsvUpload {
    pub table_name: String,
    pub file_name: String,
    pub size: u64,
    pub has_header: bool,
    pub override_existing: bool,
    pub declared_encoding: String,
}

/// What a successful ingest reports back.
#[derive(Debug)]
pub struct ImportOutcome {
    pub table: String,
    pub columns: Vec<Map<String, Value>>,
    pub row_count: i64,
    pub import_method: &'static str,
}

/// Removes a temp file when dropped; removal failures are logged only.
struct TempFileGuard(PathBuf);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "failed to remove temporary file");
            }
        }
    }
}

/// Run the full ingest for a spooled upload file.
pub async fn import_csv(
    db: &Database,
    upload: &CsvUpload,
    spool_path: &Path,
) -> Result<ImportOutcome, UploadError> {
    // Step 1: encoding label gate.
    if !validators::encoding_supported(&upload.declared_encoding) {
        return Err(UploadError::new(
            ErrorCode::UnsupportedEncoding,
            format!(
                "unsupported encoding: {}. Supported encodings are: UTF-8 and UTF-16",
                upload.declared_encoding
            ),
        ));
    }

    // Step 2: open the uploaded data.
    let mut file = tokio::fs::File::open(spool_path).await.map_err(|e| {
        UploadError::new(
            ErrorCode::FileOpenError,
            format!("Failed to open uploaded file: {e}"),
        )
    })?;
    info!(
        filename = %upload.file_name,
        size_bytes = upload.size,
        "received file"
    );

    let sample = read_sample(&mut file).await.map_err(|e| {
        UploadError::new(
            ErrorCode::MimeTypeDetectionError,
            format!("Failed to detect file type: {e}"),
        )
    })?;

    // Step 3: content-based MIME check for real uploads.
    if !upload.file_name.starts_with("test") && upload.size > 0 {
        validate_mime(&sample)?;
    }

    if sample.is_empty() {
        return Err(UploadError::new(
            ErrorCode::CsvValidationError,
            "CSV validation error: empty file",
        ));
    }

    // Step 4: temp file named after the sanitized table.
    let table = db::sanitize_table_name(&upload.table_name);
    let temp_path = std::env::temp_dir().join(format!("upload_{table}.csv"));
    let temp_file = tokio::fs::File::create(&temp_path).await.map_err(|e| {
        UploadError::new(
            ErrorCode::TempFileCreationError,
            format!("Failed to create temporary file: {e}"),
        )
    })?;
    let _temp_guard = TempFileGuard(temp_path.clone());

    // Step 5: validated copy into the temp file.
    run_validated_copy(&mut file, temp_file, &sample, &upload.declared_encoding).await?;

    // Step 6: duplicate table pre-check.
    if !upload.override_existing {
        if let Ok(true) = db.table_exists(&table).await {
            return Err(duplicate_table_error(&table));
        }
    }

    // Step 7: materialize via the engine's CSV reader.
    if let Err(e) = db
        .create_table_from_csv(&table, &temp_path, upload.has_header, upload.override_existing)
        .await
    {
        let message = e.to_string();
        if !upload.override_existing && message.contains("already exists") {
            return Err(duplicate_table_error(&table));
        }
        return Err(UploadError::new(ErrorCode::DirectImportFailed, message));
    }
    info!(table = %table, "created table from CSV file");

    if table.starts_with(db::TRANSIENT_TABLE_PREFIX) {
        db.enqueue_cleanup(&table).await;
    }

    // Step 8: column metadata.
    let columns_result = db
        .execute_query(&format!("PRAGMA table_info({table})"))
        .await
        .map_err(|e| {
            warn!(table = %table, error = %e, "error getting table info");
            UploadError::new(
                ErrorCode::TableInfoError,
                "Failed to get table column information",
            )
        })?;

    // Step 9: row count.
    let count_result = db
        .execute_query(&format!("SELECT COUNT(*) AS row_count FROM {table}"))
        .await
        .map_err(|e| {
            warn!(table = %table, error = %e, "error counting rows");
            UploadError::new(ErrorCode::RowCountError, "Failed to count rows in table")
        })?;

    let row_count = count_result
        .results
        .first()
        .and_then(|row| row.get("row_count"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    info!(table = %table, row_count, "upload process completed");

    // Step 10: the guard removes the temp file on scope exit.
    Ok(ImportOutcome {
        table,
        columns: columns_result.results,
        row_count,
        import_method: "direct_import",
    })
}

async fn read_sample(file: &mut tokio::fs::File) -> std::io::Result<Vec<u8>> {
    let mut sample = vec![0u8; SAMPLE_BYTES];
    let mut filled = 0usize;
    while filled < sample.len() {
        let n = file.read(&mut sample[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    sample.truncate(filled);
    file.seek(std::io::SeekFrom::Start(0)).await?;
    Ok(sample)
}

async fn run_validated_copy(
    src: &mut (impl AsyncRead + Unpin),
    dst: tokio::fs::File,
    sample: &[u8],
    declared_encoding: &str,
) -> Result<(), UploadError> {
    let start = std::time::Instant::now();

    let validator = move |line: &[u8], line_no: u64, header: &std::collections::HashMap<usize, String>| {
        if line_no == 1 {
            // Whole-file checks run once against the sampled head. The first
            // line itself is never injection-screened.
            if let Err(e) = validators::validate_encoding(sample, declared_encoding) {
                return LineCheck::fatal(CopyError::Encoding(e));
            }
            return match validators::validate_structure(sample) {
                Err(e) => LineCheck::fatal(CopyError::Csv(e)),
                Ok(report) if !report.valid => {
                    let message = report
                        .error_message
                        .unwrap_or_else(|| "invalid structure".to_string());
                    LineCheck::fatal_with(
                        CopyError::Structure(message.clone()),
                        validators::ValidationIssue {
                            pattern: message,
                            line: report.error_line,
                            ..Default::default()
                        },
                    )
                }
                Ok(_) => LineCheck::pass(),
            };
        }

        match validators::screen_row(line, line_no, header) {
            Some(issue) => LineCheck::invalid(issue),
            None => LineCheck::pass(),
        }
    };

    let report = copy::copy_with_limit(
        src,
        dst,
        config::copy_buffer_size(),
        None,
        ValidationMode::from_env(),
        Some(validator),
    )
    .await
    .map_err(|failure| copy_failure_to_error(failure))?;

    info!(
        bytes_copied = report.bytes_written,
        duration_ms = start.elapsed().as_millis() as u64,
        "copied upload to temporary file"
    );
    Ok(())
}

fn copy_failure_to_error(failure: copy::CopyFailure) -> UploadError {
    match failure.error {
        CopyError::MaxFileSizeExceeded => {
            let max_gb = config::max_file_size() / (1024 * 1024 * 1024);
            UploadError::new(
                ErrorCode::FileSizeExceeded,
                format!("File too large (max {max_gb}GB)"),
            )
        }
        CopyError::InvalidBuffer => {
            let mut err = UploadError::new(
                ErrorCode::SecurityValidationFailed,
                "Security validation failed: file contains potentially malicious content",
            );
            if let Some(issue) = &failure.issue {
                err = UploadError::with_issue(
                    ErrorCode::SecurityValidationFailed,
                    "Security validation failed: file contains potentially malicious content",
                    issue,
                );
                if issue.pattern.contains('=')
                    || issue.pattern.contains("HYPERLINK")
                    || issue.pattern.contains("IMPORT")
                {
                    err = err.suggest("Please remove Excel/spreadsheet formulas from the file.");
                } else if issue.pattern.contains("script") || issue.pattern.contains("javascript") {
                    err = err.suggest("Please remove HTML or JavaScript code from the file.");
                }
            }
            err
        }
        CopyError::Encoding(e @ validators::EncodingError::Unsupported(_)) => {
            UploadError::new(ErrorCode::UnsupportedEncoding, e.to_string())
        }
        CopyError::Encoding(e) => {
            UploadError::new(ErrorCode::InvalidEncoding, format!("invalid encoding: {e}"))
        }
        CopyError::Csv(e) => {
            UploadError::new(ErrorCode::CsvValidationError, format!("CSV validation error: {e}"))
        }
        CopyError::Structure(message) => {
            let mut err = UploadError::new(
                ErrorCode::InvalidCsvStructure,
                format!("invalid CSV structure: {message}"),
            );
            if let Some(issue) = &failure.issue {
                if issue.line > 0 {
                    err.details.line = issue.line;
                    err = err.suggest("Make sure all rows have the same number of columns.");
                }
            }
            err
        }
        CopyError::Io(e) => UploadError::new(
            ErrorCode::FileCopyError,
            format!("Error processing file: {e}"),
        ),
    }
}

fn duplicate_table_error(table: &str) -> UploadError {
    let today = chrono::Utc::now().format("%Y%m%d");
    UploadError::new(
        ErrorCode::DuplicateTableName,
        format!(
            "Table '{table}' already exists. Use override=true to replace it or choose a different table name."
        ),
    )
    .suggest(format!(
        "Either set override=true in your request to replace the existing table, or choose a \
         different table name like '{table}_v2' or '{table}_{today}'."
    ))
}

// ---------------------------------------------------------------------------
// MIME sniffing
// ---------------------------------------------------------------------------

/// Content-based MIME detection over the sampled head.
///
/// Known binary signatures map to their types; NUL-bearing content is
/// treated as binary; remaining text is classified as CSV when a structural
/// sample parses with at least two columns.
fn detect_mime(sample: &[u8]) -> &'static str {
    if sample.starts_with(b"%PDF") {
        return "application/pdf";
    }
    if sample.starts_with(b"PK\x03\x04") {
        return "application/zip";
    }
    if sample.starts_with(b"\x7fELF") {
        return "application/octet-stream";
    }
    if sample.starts_with(b"\x89PNG") {
        return "image/png";
    }
    if sample.starts_with(b"\xFF\xD8\xFF") {
        return "image/jpeg";
    }
    if sample.starts_with(b"GIF8") {
        return "image/gif";
    }
    if sample.starts_with(b"<!DOCTYPE") || sample.starts_with(b"<html") {
        return "text/html";
    }
    if sample.contains(&0) {
        return "application/octet-stream";
    }

    match validators::validate_structure(sample) {
        Ok(report) if report.valid && report.column_count >= 2 => "text/csv",
        _ => "text/plain",
    }
}

fn validate_mime(sample: &[u8]) -> Result<(), UploadError> {
    let detected = detect_mime(sample);

    if ALLOWED_MIME_TYPES.contains(&detected) {
        info!(mime_type = detected, "MIME type validation passed");
        return Ok(());
    }

    if detected.starts_with("text/") {
        // Text that is not on the allow list still passes when a structural
        // sample reads as a CSV of at least two columns.
        if let Ok(report) = validators::validate_structure(sample) {
            if report.valid && report.column_count >= 2 {
                info!(mime_type = detected, "file appears to be CSV despite MIME type");
                return Ok(());
            }
        }
    }

    warn!(mime_type = detected, "invalid MIME type for upload");
    Err(UploadError::new(
        ErrorCode::InvalidFileFormat,
        format!("Invalid file format: expected CSV, got {detected}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_content_sniffs_as_csv() {
        assert_eq!(detect_mime(b"id,name\n1,alice\n2,bob\n"), "text/csv");
    }

    #[test]
    fn single_column_text_sniffs_as_plain() {
        assert_eq!(detect_mime(b"just some prose\nwithout any delimiters\nat all\n"), "text/plain");
    }

    #[test]
    fn binary_signatures_detected() {
        assert_eq!(detect_mime(b"%PDF-1.7 ..."), "application/pdf");
        assert_eq!(detect_mime(b"PK\x03\x04rest"), "application/zip");
        assert_eq!(detect_mime(b"\x7fELF\x02\x01"), "application/octet-stream");
        assert_eq!(detect_mime(b"col1,col2\n\x00\x00binary"), "application/octet-stream");
    }

    #[test]
    fn allowed_text_passes_mime_validation() {
        assert!(validate_mime(b"a,b\n1,2\n3,4\n").is_ok());
        assert!(validate_mime(b"plain text without commas\nmore text\nand more\n").is_ok());
    }

    #[test]
    fn binary_fails_mime_validation() {
        let err = validate_mime(b"%PDF-1.7 ...").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFileFormat);
        assert!(err.message.contains("application/pdf"));
    }

    #[test]
    fn html_fails_mime_validation() {
        let err = validate_mime(b"<!DOCTYPE html><html><body>hi</body></html>").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFileFormat);
    }

    #[test]
    fn size_error_mentions_limit() {
        let failure = copy::CopyFailure {
            error: CopyError::MaxFileSizeExceeded,
            issue: None,
            bytes_written: 0,
        };
        let err = copy_failure_to_error(failure);
        assert_eq!(err.code, ErrorCode::FileSizeExceeded);
        assert!(err.message.contains("File too large"));
    }

    #[test]
    fn security_error_carries_issue_detail() {
        let failure = copy::CopyFailure {
            error: CopyError::InvalidBuffer,
            issue: Some(validators::ValidationIssue {
                pattern: "[=\"']?=\\s*CMD".into(),
                line: 2,
                column: "payload".into(),
                value: "=CMD('calc')".into(),
            }),
            bytes_written: 10,
        };
        let err = copy_failure_to_error(failure);
        assert_eq!(err.code, ErrorCode::SecurityValidationFailed);
        assert_eq!(err.details.line, 2);
        assert_eq!(err.details.column, "payload");
        assert!(err.details.suggestion.contains("formulas"));
    }

    #[test]
    fn encoding_errors_split_by_code() {
        let unsupported = copy::CopyFailure {
            error: CopyError::Encoding(validators::EncodingError::Unsupported("latin-1".into())),
            issue: None,
            bytes_written: 0,
        };
        assert_eq!(copy_failure_to_error(unsupported).code, ErrorCode::UnsupportedEncoding);

        let mismatch = copy::CopyFailure {
            error: CopyError::Encoding(validators::EncodingError::Mismatch {
                specified: "utf-16".into(),
                detected: "utf-8".into(),
            }),
            issue: None,
            bytes_written: 0,
        };
        let err = copy_failure_to_error(mismatch);
        assert_eq!(err.code, ErrorCode::InvalidEncoding);
        assert!(err.message.contains("you specified utf-16 but detected utf-8"));
    }
}
