//! API error taxonomy.
//!
//! The upload pipeline reports failures through a closed set of error codes
//! with stable meanings. Each code maps to an HTTP status and carries a human
//! suggestion; handlers serialize them as
//! `{"errors": [{"code", "message", "details"}]}`.

use serde::Serialize;

use crate::validators::ValidationIssue;

/// Closed set of API error codes for the upload pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequestParameters,
    FileOpenError,
    TempFileCreationError,
    FileCopyError,
    MimeTypeDetectionError,
    CsvFormatCheckError,
    InvalidFileFormat,
    CsvValidationError,
    InvalidCsvStructure,
    InvalidEncoding,
    UnsupportedEncoding,
    SecurityValidationFailed,
    FileSizeExceeded,
    DirectImportFailed,
    TableInfoError,
    RowCountError,
    DuplicateTableName,
}

impl ErrorCode {
    /// Default human suggestion for the code.
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequestParameters => {
                "Please check the required parameters and try again."
            }
            ErrorCode::FileOpenError => "Please ensure the file is not corrupted and try again.",
            ErrorCode::TempFileCreationError | ErrorCode::FileCopyError => {
                "Please try again or contact support if the issue persists."
            }
            ErrorCode::MimeTypeDetectionError => {
                "Please ensure the file is not corrupted and try again."
            }
            ErrorCode::CsvFormatCheckError => "Please ensure the file is a valid CSV file.",
            ErrorCode::InvalidFileFormat => {
                "Please upload a valid CSV file with extensions like .csv, .txt, or .tsv."
            }
            ErrorCode::CsvValidationError => {
                "The file could not be processed. Please check the CSV format."
            }
            ErrorCode::InvalidCsvStructure => {
                "Please ensure the CSV file has a consistent structure."
            }
            ErrorCode::InvalidEncoding => {
                "Please ensure the file is saved with UTF-8 encoding before uploading."
            }
            ErrorCode::UnsupportedEncoding => {
                "Please ensure the file is saved with a supported encoding (UTF-8 or UTF-16) before uploading."
            }
            ErrorCode::SecurityValidationFailed => {
                "Please ensure the file does not contain formulas, scripts or other potentially harmful content."
            }
            ErrorCode::FileSizeExceeded => {
                "Please reduce the file size or split it into smaller files."
            }
            ErrorCode::DirectImportFailed => {
                "Check the CSV file structure and ensure it contains valid data."
            }
            ErrorCode::TableInfoError => {
                "The table may not have been created correctly. Check the CSV file structure."
            }
            ErrorCode::RowCountError => {
                "The data may not have been imported correctly. Check the CSV file structure."
            }
            ErrorCode::DuplicateTableName => {
                "Choose a different table name or use the override parameter to replace the existing table."
            }
        }
    }

    /// HTTP status for the code: everything before the import stage is 400
    /// (the size cap is 413); failures once the engine is involved are 422.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidRequestParameters
            | ErrorCode::FileOpenError
            | ErrorCode::TempFileCreationError
            | ErrorCode::FileCopyError
            | ErrorCode::MimeTypeDetectionError
            | ErrorCode::CsvFormatCheckError
            | ErrorCode::InvalidFileFormat
            | ErrorCode::CsvValidationError
            | ErrorCode::InvalidCsvStructure
            | ErrorCode::InvalidEncoding
            | ErrorCode::UnsupportedEncoding
            | ErrorCode::SecurityValidationFailed => 400,
            ErrorCode::FileSizeExceeded => 413,
            ErrorCode::DirectImportFailed
            | ErrorCode::TableInfoError
            | ErrorCode::RowCountError
            | ErrorCode::DuplicateTableName => 422,
        }
    }
}

/// Location and remediation detail attached to an upload error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorDetail {
    pub line: u64,
    pub column: String,
    #[serde(rename = "expectedType")]
    pub expected_type: String,
    #[serde(rename = "foundValue")]
    pub found_value: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub suggestion: String,
}

/// A single upload error with its code, message, and detail object.
#[derive(Debug, Clone, Serialize)]
pub struct UploadError {
    pub code: ErrorCode,
    pub message: String,
    pub details: ErrorDetail,
}

impl UploadError {
    /// Error with the code's default suggestion and no location detail.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        UploadError {
            code,
            message: message.into(),
            details: ErrorDetail {
                suggestion: code.suggestion().to_string(),
                ..ErrorDetail::default()
            },
        }
    }

    /// Error enriched with the line/column/value of a validation issue.
    pub fn with_issue(code: ErrorCode, message: impl Into<String>, issue: &ValidationIssue) -> Self {
        let mut e = UploadError::new(code, message);
        e.details.line = issue.line;
        e.details.column = issue.column.clone();
        e.details.found_value = issue.value.clone();
        e
    }

    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.details.suggestion = suggestion.into();
        self
    }
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UploadError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::DuplicateTableName).unwrap();
        assert_eq!(json, "\"DUPLICATE_TABLE_NAME\"");
        let json = serde_json::to_string(&ErrorCode::SecurityValidationFailed).unwrap();
        assert_eq!(json, "\"SECURITY_VALIDATION_FAILED\"");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorCode::InvalidEncoding.http_status(), 400);
        assert_eq!(ErrorCode::SecurityValidationFailed.http_status(), 400);
        assert_eq!(ErrorCode::FileSizeExceeded.http_status(), 413);
        assert_eq!(ErrorCode::DuplicateTableName.http_status(), 422);
        assert_eq!(ErrorCode::DirectImportFailed.http_status(), 422);
    }

    #[test]
    fn detail_json_field_names() {
        let err = UploadError::new(ErrorCode::InvalidCsvStructure, "bad structure");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "INVALID_CSV_STRUCTURE");
        assert!(json["details"]["expectedType"].is_string());
        assert!(json["details"]["foundValue"].is_string());
    }
}
