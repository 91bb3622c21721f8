//! Content validators for untrusted CSV uploads.
//!
//! Three independent checks compose into the upload pipeline:
//!
//! 1. **Encoding** — the declared encoding label is checked against a small
//!    statistical detector (BOM sniff, NUL distribution, UTF-8 validity).
//!    Only UTF-8 and UTF-16 are accepted.
//! 2. **Structure** — a bounded sample of the file is parsed to detect the
//!    delimiter, verify consistent column counts, and guess header presence.
//! 3. **Injection screen** — each data row is scanned for spreadsheet formula
//!    and script injection patterns with a cheap byte-sequence prefilter in
//!    front of a precompiled regex set.
//!
//! The screens share no state; the only cross-call context (the header map
//! captured from line 1) is owned by the bounded copier.

use std::collections::HashMap;
use std::env;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// Number of records sampled for structure validation.
const MAX_SAMPLE_RECORDS: usize = 20;
/// Lines inspected when scoring delimiters.
const DELIMITER_SAMPLE_LINES: usize = 5;
/// At most this many bytes of the file are parsed for structure checks.
const MAX_SAMPLE_BYTES: usize = 32 * 1024;
/// A CSV needs at least this many columns to count as tabular.
const MIN_COLUMN_COUNT: usize = 2;

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

// ---------------------------------------------------------------------------
// Validation mode
// ---------------------------------------------------------------------------

/// Process-wide policy for invalid CSV lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Fail the whole ingest on the first invalid line (default).
    RejectFile,
    /// Skip invalid lines and record a warning.
    RejectRow,
    /// Write invalid lines anyway and record a warning.
    Ignore,
}

impl ValidationMode {
    pub fn from_env() -> Self {
        Self::parse(env::var("ENV_FILE_VALIDATION_MODE").ok().as_deref())
    }

    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some("") => ValidationMode::RejectFile,
            Some("reject_file") => ValidationMode::RejectFile,
            Some("reject_row") => ValidationMode::RejectRow,
            Some("ignore") => ValidationMode::Ignore,
            Some(other) => {
                warn!(mode = other, "invalid ENV_FILE_VALIDATION_MODE, using reject_file");
                ValidationMode::RejectFile
            }
        }
    }
}

/// A structured finding produced by the injection screen or structure check.
#[derive(Debug, Clone, Default)]
pub struct ValidationIssue {
    /// Identifier of the matched pattern (or a structural error message).
    pub pattern: String,
    /// 1-based line number.
    pub line: u64,
    /// Column name resolved via the header map, else `Column <n>`.
    pub column: String,
    /// The offending field value.
    pub value: String,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("unsupported encoding: {0}. Supported encodings are: UTF-8 and UTF-16")]
    Unsupported(String),
    #[error("detected encoding is not supported: {0}. Supported encodings are: UTF-8 and UTF-16")]
    UnsupportedDetected(String),
    #[error("file is not valid UTF-8 encoded")]
    NotUtf8,
    #[error("file encoding mismatch: you specified {specified} but detected {detected}")]
    Mismatch { specified: String, detected: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Detected {
    Utf8,
    Utf16,
    Other,
}

fn detected_label(d: Detected) -> &'static str {
    match d {
        Detected::Utf8 => "utf-8",
        Detected::Utf16 => "utf-16",
        Detected::Other => "unknown",
    }
}

/// Classify a buffer as UTF-8, UTF-16, or other.
///
/// BOMs are checked first; BOM-less UTF-16 is inferred from the NUL-byte
/// distribution (ASCII-heavy UTF-16 text has a zero byte in every other
/// position). Anything that is valid UTF-8 classifies as UTF-8.
fn detect_encoding(data: &[u8]) -> Detected {
    if data.len() >= 2 {
        let bom = [data[0], data[1]];
        if bom == [0xFF, 0xFE] || bom == [0xFE, 0xFF] {
            return Detected::Utf16;
        }
    }
    if data.len() >= 3 && data[0..3] == [0xEF, 0xBB, 0xBF] {
        return Detected::Utf8;
    }

    // NUL bytes never occur in CSV text; a high ratio in alternating
    // positions is the UTF-16 signature.
    let sample = &data[..data.len().min(MAX_SAMPLE_BYTES)];
    if !sample.is_empty() {
        let nuls = sample.iter().filter(|&&b| b == 0).count();
        if nuls * 3 > sample.len() {
            let even_nuls = sample.iter().step_by(2).filter(|&&b| b == 0).count();
            let odd_nuls = sample.iter().skip(1).step_by(2).filter(|&&b| b == 0).count();
            if even_nuls == 0 || odd_nuls == 0 || even_nuls * 4 < odd_nuls || odd_nuls * 4 < even_nuls
            {
                return Detected::Utf16;
            }
        }
    }

    if std::str::from_utf8(data).is_ok() {
        return Detected::Utf8;
    }
    Detected::Other
}

fn declared_is_utf8(label: &str) -> bool {
    label.is_empty() || label == "utf-8" || label == "utf8"
}

fn declared_is_utf16(label: &str) -> bool {
    label == "utf-16" || label == "utf16"
}

/// True when the user-declared label is one this service accepts.
pub fn encoding_supported(label: &str) -> bool {
    let lower = label.to_ascii_lowercase();
    declared_is_utf8(&lower) || declared_is_utf16(&lower)
}

/// Check a buffer against the user-declared encoding label.
///
/// Empty labels mean UTF-8. Empty buffers always pass. A detector result
/// outside UTF-8/UTF-16 is re-tested for UTF-8 validity before being
/// rejected; a declared/detected disagreement on the UTF-8/UTF-16 axis is a
/// mismatch.
pub fn validate_encoding(data: &[u8], declared: &str) -> Result<(), EncodingError> {
    let declared = declared.to_ascii_lowercase();

    if !encoding_supported(&declared) {
        return Err(EncodingError::Unsupported(declared));
    }
    if data.is_empty() {
        return Ok(());
    }

    let detected = detect_encoding(data);
    let mut is_utf8 = detected == Detected::Utf8;
    let is_utf16 = detected == Detected::Utf16;
    let mut label = detected_label(detected).to_string();

    if !is_utf8 && !is_utf16 {
        if std::str::from_utf8(data).is_ok() {
            is_utf8 = true;
            label = "utf-8".to_string();
        } else {
            return Err(EncodingError::UnsupportedDetected(label));
        }
    }

    if declared_is_utf8(&declared) {
        if is_utf8 || declared.is_empty() {
            if std::str::from_utf8(data).is_err() {
                return Err(EncodingError::NotUtf8);
            }
            return Ok(());
        }
        return Err(EncodingError::Mismatch {
            specified: declared,
            detected: label,
        });
    }

    // Declared UTF-16.
    if !is_utf16 {
        return Err(EncodingError::Mismatch {
            specified: declared,
            detected: label,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CSV structure
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StructureError {
    #[error("empty file")]
    EmptyFile,
    #[error("delimiter detection failed: {0}")]
    DelimiterDetection(String),
    #[error("CSV format validation failed: {0}")]
    Parse(String),
}

/// Result of sampling a CSV for structural validity.
#[derive(Debug, Clone)]
pub struct StructureReport {
    pub valid: bool,
    pub delimiter: u8,
    pub has_header: bool,
    pub column_count: usize,
    pub has_quotes: bool,
    pub sample_rows: usize,
    pub line_terminator: &'static str,
    /// Set when `valid` is false; for inconsistent widths it carries the
    /// 1-based line number of the first offending row.
    pub error_message: Option<String>,
    pub error_line: u64,
}

/// Score candidate delimiters against a sample and pick the best.
pub fn detect_delimiter(data: &[u8]) -> Result<u8, StructureError> {
    let text = String::from_utf8_lossy(data);
    let sample_lines: Vec<&str> = text
        .lines()
        .filter(|l| !l.is_empty())
        .take(DELIMITER_SAMPLE_LINES)
        .collect();

    if sample_lines.is_empty() {
        return Err(StructureError::EmptyFile);
    }

    let mut best = b',';
    let mut best_score = -1i32;
    for &delim in &CANDIDATE_DELIMITERS {
        if let Some(score) = score_delimiter(&sample_lines, delim) {
            if score > best_score {
                best_score = score;
                best = delim;
            }
        }
    }
    Ok(best)
}

fn score_delimiter(lines: &[&str], delimiter: u8) -> Option<i32> {
    let records = parse_records(&lines.join("\n"), delimiter, lines.len())?;
    if records.is_empty() {
        return None;
    }

    let first_width = records[0].len();
    if first_width < MIN_COLUMN_COUNT {
        return None;
    }
    if records[1..].iter().any(|r| r.len() != first_width) {
        return None;
    }

    // Base score for consistent widths, with bonuses for the common cases.
    let mut score = 15;
    if delimiter == b',' {
        score += 5;
    }
    if (3..=20).contains(&first_width) {
        score += 3;
    }
    if empty_field_ratio(&records) < 0.1 {
        score += 2;
    }
    Some(score)
}

fn parse_records(text: &str, delimiter: u8, max: usize) -> Option<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::None)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    for result in reader.records().take(max) {
        match result {
            Ok(rec) => records.push(rec.iter().map(|f| f.to_string()).collect()),
            Err(_) => return None,
        }
    }
    Some(records)
}

fn empty_field_ratio(records: &[Vec<String>]) -> f64 {
    let mut total = 0usize;
    let mut empty = 0usize;
    for record in records {
        for field in record {
            total += 1;
            if field.is_empty() {
                empty += 1;
            }
        }
    }
    if total == 0 {
        return 1.0;
    }
    empty as f64 / total as f64
}

fn detect_line_terminator(data: &[u8]) -> &'static str {
    if data.windows(2).any(|w| w == b"\r\n") {
        "\r\n"
    } else if data.contains(&b'\n') {
        "\n"
    } else if data.contains(&b'\r') {
        "\r"
    } else {
        "\n"
    }
}

/// Validate structural properties of (up to 32 KiB of) raw CSV bytes.
pub fn validate_structure(data: &[u8]) -> Result<StructureReport, StructureError> {
    let delimiter = detect_delimiter(data)?;

    let sample = &data[..data.len().min(MAX_SAMPLE_BYTES)];
    let text = String::from_utf8_lossy(sample);

    // Strict parse for the sample itself.
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records: Vec<Vec<String>> = Vec::new();
    for result in reader.records().take(MAX_SAMPLE_RECORDS) {
        match result {
            Ok(rec) => records.push(rec.iter().map(|f| f.to_string()).collect()),
            Err(e) => return Err(StructureError::Parse(e.to_string())),
        }
    }

    if records.is_empty() {
        return Err(StructureError::Parse("file contains no data".to_string()));
    }

    let column_count = records[0].len();
    let mut report = StructureReport {
        valid: true,
        delimiter,
        has_header: false,
        column_count,
        has_quotes: records
            .iter()
            .any(|r| r.iter().any(|f| f.contains('"'))),
        sample_rows: records.len(),
        line_terminator: detect_line_terminator(sample),
        error_message: None,
        error_line: 0,
    };

    for (i, record) in records.iter().enumerate() {
        if record.len() != column_count {
            report.valid = false;
            report.error_line = (i + 1) as u64;
            report.error_message = Some(format!(
                "inconsistent column count on line {}: got {}, expected {}",
                i + 1,
                record.len(),
                column_count
            ));
            break;
        }
    }

    report.has_header = detect_header(&records);
    Ok(report)
}

/// Heuristic header detection over the sampled records.
///
/// Weighted evidence: character-class contrast between row 1 and the rest,
/// cell-length variance, capitalisation, numeric-density contrast, absence of
/// empty cells, and word-count contrast. A score above 3 counts as a header.
fn detect_header(records: &[Vec<String>]) -> bool {
    if records.len() < 2 {
        return false;
    }

    let header = &records[0];
    let data = &records[1..];
    let mut score = 0i32;

    if header_alpha_contrast(header, data) {
        score += 3;
    }
    if consistent_lengths(header) {
        score += 1;
    }

    let capitals = header.iter().filter(|c| has_capitalized_word(c)).count();
    if capitals > header.len() / 3 {
        score += 2;
    }

    if numeric_ratio_contrast(header, data) < 0.5 {
        score += 2;
    }

    let empty = header.iter().filter(|c| c.trim().is_empty()).count();
    if empty == 0 {
        score += 1;
    } else if empty > header.len() / 3 {
        score -= 2;
    }

    if fewer_words(header, data) {
        score += 1;
    }

    score > 3
}

fn alpha_ratio(row: &[String]) -> f64 {
    let mut total = 0usize;
    let mut alpha = 0usize;
    for cell in row {
        total += cell.len();
        alpha += cell.chars().filter(|c| c.is_ascii_alphabetic()).count();
    }
    if total == 0 {
        return 0.0;
    }
    alpha as f64 / total as f64
}

fn header_alpha_contrast(header: &[String], data: &[Vec<String>]) -> bool {
    let header_ratio = alpha_ratio(header);
    if data.is_empty() {
        return header_ratio > 0.7;
    }
    let data_ratio =
        data.iter().map(|r| alpha_ratio(r)).sum::<f64>() / data.len() as f64;
    header_ratio > data_ratio
}

fn consistent_lengths(row: &[String]) -> bool {
    if row.len() < 2 {
        return true;
    }
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for cell in row {
        let l = cell.len() as f64;
        sum += l;
        sum_sq += l * l;
    }
    let mean = sum / row.len() as f64;
    let variance = sum_sq / row.len() as f64 - mean * mean;
    variance < 25.0
}

fn contains_digit(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_digit())
}

fn has_capitalized_word(s: &str) -> bool {
    s.split_whitespace()
        .any(|w| w.chars().next().is_some_and(|c| c.is_ascii_uppercase()))
}

fn numeric_ratio_contrast(header: &[String], data: &[Vec<String>]) -> f64 {
    let numeric_in_header = header.iter().filter(|c| contains_digit(c)).count();
    let header_ratio = numeric_in_header as f64 / header.len() as f64;

    if data.is_empty() {
        return header_ratio;
    }

    let mut numeric_in_data = 0usize;
    let mut total = 0usize;
    for row in data {
        total += row.len();
        numeric_in_data += row.iter().filter(|c| contains_digit(c)).count();
    }
    if total == 0 {
        return 1.0;
    }
    let data_ratio = numeric_in_data as f64 / total as f64;
    if data_ratio == 0.0 {
        return 1.0;
    }
    header_ratio / data_ratio
}

fn fewer_words(header: &[String], data: &[Vec<String>]) -> bool {
    let header_words: usize = header.iter().map(|c| c.split_whitespace().count()).sum();
    let avg_header = header_words as f64 / header.len() as f64;

    if data.is_empty() {
        return true;
    }
    let mut words = 0usize;
    let mut cells = 0usize;
    for row in data {
        cells += row.len();
        words += row.iter().map(|c| c.split_whitespace().count()).sum::<usize>();
    }
    if cells == 0 {
        return true;
    }
    avg_header <= words as f64 / cells as f64
}

// ---------------------------------------------------------------------------
// Injection screen
// ---------------------------------------------------------------------------

/// Cheap byte sequences gating the expensive regex pass.
const SUSPICIOUS_SEQUENCES: &[&[u8]] = &[
    b"<script",
    b"</script",
    b"<img",
    b"javascript:",
    b"onerror=",
    b"onclick=",
    b"onload=",
    b"onmouseover=",
    b"onmouseout=",
    b"onchange=",
    b"onsubmit=",
    b"onfocus=",
    b"onblur=",
    b"onkeydown=",
    b"onkeypress=",
    b"onkeyup=",
    b"=cmd",
    b"=CMD",
    b"-cmd",
    b"cmd|",
    b"/C ",
    b"!A",
    b"=DDE",
    b"=SUM",
    b"=HYPERLINK",
    b"IMPORTXML",
    b"CONCATENATE",
    b"+IMPORT",
    b"@SUM",
];

/// Formula- and script-injection patterns, compiled once.
static INJECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Formula injection
        r#"[="']?=\s*[A-Za-z]+\s*\(.*\)"#,
        r#"[="']?\+\s*[A-Za-z]+\s*\(.*\)"#,
        r#"[="']?-\s*[A-Za-z]+\s*\(.*\)"#,
        r#"[="']?@\s*[A-Za-z]+\s*\(.*\)"#,
        r#"[="']?=\s*CMD\s*\(.*\)"#,
        r#"[="']?=\s*cmd\.[a-z]+"#,
        r#"[="']?=\s*cmd\|.*'?/C"#,
        r#"-cmd\.exe!"#,
        r#"\+cmd\.exe!"#,
        r#"[="']?=\s*DDE\s*\(.*\)"#,
        r#"[="']?=\s*HYPERLINK\s*\(.*\)"#,
        r#"\+IMPORTXML\s*\(.*\)"#,
        // XSS
        r#"<script[^>]*>.*</script>"#,
        r#"<img[^>]*onerror="#,
        r#"javascript:"#,
        r#"on\w+=['"`][^'"`]*['"`]"#,
        r#"on\w+=[^\s>]*"#,
        r#"<[^>]*\son\w+\s*="#,
        r#"data:text/html"#,
        r#"<iframe[^>]*>"#,
        r#"\balert\s*\("#,
        r#"\beval\s*\("#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("injection pattern must compile"))
    .collect()
});

fn contains_suspicious_bytes(data: &[u8]) -> bool {
    SUSPICIOUS_SEQUENCES
        .iter()
        .any(|seq| data.windows(seq.len()).any(|w| &w == seq))
}

/// Split a CSV line into fields, honoring quotes and sniffing the delimiter.
pub fn split_csv_line(line: &[u8]) -> Vec<String> {
    let delimiter = if line.contains(&b'\t') {
        b'\t'
    } else if line.contains(&b';') {
        b';'
    } else {
        b','
    };

    let mut fields = Vec::new();
    let mut in_quote = false;
    let mut start = 0usize;
    for (i, &c) in line.iter().enumerate() {
        if c == b'"' {
            in_quote = !in_quote;
        } else if !in_quote && c == delimiter {
            fields.push(String::from_utf8_lossy(&line[start..i]).into_owned());
            start = i + 1;
        }
    }
    if start < line.len() {
        let mut last = &line[start..];
        if last.ends_with(b"\n") {
            last = &last[..last.len() - 1];
        }
        if last.ends_with(b"\r") {
            last = &last[..last.len() - 1];
        }
        fields.push(String::from_utf8_lossy(last).into_owned());
    }
    fields
}

/// Resolve a 0-based field index to a column name via the header map.
pub fn column_name(index: Option<usize>, header: &HashMap<usize, String>) -> String {
    match index {
        None => String::new(),
        Some(i) => header
            .get(&i)
            .cloned()
            .unwrap_or_else(|| format!("Column {}", i + 1)),
    }
}

/// Two-stage injection screen over a single CSV line.
///
/// Returns `None` when the row is safe; `Some(issue)` identifies the first
/// matched pattern, the offending field value, and the column it lives in.
pub fn screen_row(
    row: &[u8],
    line: u64,
    header: &HashMap<usize, String>,
) -> Option<ValidationIssue> {
    if !contains_suspicious_bytes(row) {
        return None;
    }

    let text = String::from_utf8_lossy(row);
    let (pattern, matched) = INJECTION_PATTERNS.iter().find_map(|re| {
        re.find(&text)
            .map(|m| (re.as_str().to_string(), m.as_str().to_string()))
    })?;

    let fields = split_csv_line(row);
    let field_index = fields.iter().position(|f| f.contains(&matched));
    let value = field_index
        .map(|i| fields[i].clone())
        .unwrap_or_default();

    Some(ValidationIssue {
        pattern,
        line,
        column: column_name(field_index, header),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- encoding --

    #[test]
    fn empty_buffer_passes_any_supported_label() {
        assert!(validate_encoding(b"", "").is_ok());
        assert!(validate_encoding(b"", "utf-8").is_ok());
        assert!(validate_encoding(b"", "utf-16").is_ok());
    }

    #[test]
    fn unsupported_label_rejected() {
        let err = validate_encoding(b"a,b\n", "latin-1").unwrap_err();
        assert!(matches!(err, EncodingError::Unsupported(_)));
        assert!(err.to_string().contains("unsupported encoding"));
    }

    #[test]
    fn plain_utf8_accepted_with_default_label() {
        assert!(validate_encoding(b"id,name\n1,alice\n", "").is_ok());
        assert!(validate_encoding("id,näme\n1,ünïcode\n".as_bytes(), "utf-8").is_ok());
    }

    #[test]
    fn declared_utf16_but_utf8_bytes_is_a_mismatch() {
        let err = validate_encoding(b"id,name\n1,alice\n", "utf-16").unwrap_err();
        assert_eq!(
            err.to_string(),
            "file encoding mismatch: you specified utf-16 but detected utf-8"
        );
    }

    #[test]
    fn utf16_bom_detected() {
        let mut data = vec![0xFF, 0xFE];
        for b in b"a,b\n" {
            data.push(*b);
            data.push(0);
        }
        assert!(validate_encoding(&data, "utf-16").is_ok());
        // Declared UTF-8 against UTF-16 content is a mismatch.
        let err = validate_encoding(&data, "utf-8").unwrap_err();
        assert!(matches!(err, EncodingError::Mismatch { .. }));
    }

    #[test]
    fn invalid_utf8_without_utf16_signature_rejected() {
        let data = [0xC3, 0x28, 0xA0, 0xFF, b'x'];
        let err = validate_encoding(&data, "").unwrap_err();
        assert!(matches!(
            err,
            EncodingError::NotUtf8 | EncodingError::UnsupportedDetected(_)
        ));
    }

    // -- structure --

    #[test]
    fn comma_wins_on_plain_csv() {
        let delim = detect_delimiter(b"id,name,age\n1,alice,30\n2,bob,25\n").unwrap();
        assert_eq!(delim, b',');
    }

    #[test]
    fn semicolon_detected_when_consistent() {
        let delim = detect_delimiter(b"id;name;age\n1;alice;30\n2;bob;25\n").unwrap();
        assert_eq!(delim, b';');
    }

    #[test]
    fn tab_detected() {
        let delim = detect_delimiter(b"id\tname\n1\talice\n2\tbob\n").unwrap();
        assert_eq!(delim, b'\t');
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(detect_delimiter(b"").unwrap_err(), StructureError::EmptyFile);
        assert_eq!(
            detect_delimiter(b"\n\n").unwrap_err(),
            StructureError::EmptyFile
        );
    }

    #[test]
    fn structure_report_on_clean_file() {
        let report =
            validate_structure(b"id,name,age\n1,alice,30\n2,bob,25\n3,carol,41\n").unwrap();
        assert!(report.valid);
        assert_eq!(report.column_count, 3);
        assert_eq!(report.delimiter, b',');
        assert!(report.has_header);
        assert_eq!(report.line_terminator, "\n");
        assert!(!report.has_quotes);
    }

    #[test]
    fn inconsistent_width_reported_with_line() {
        let report = validate_structure(b"a,b,c\n1,2,3\n1,2\n4,5,6\n").unwrap();
        assert!(!report.valid);
        assert_eq!(report.error_line, 3);
        let msg = report.error_message.unwrap();
        assert!(msg.contains("inconsistent column count on line 3"));
    }

    #[test]
    fn crlf_terminator_detected() {
        let report = validate_structure(b"a,b\r\n1,2\r\n").unwrap();
        assert_eq!(report.line_terminator, "\r\n");
    }

    #[test]
    fn numeric_rows_do_not_look_like_headers() {
        let records: Vec<Vec<String>> = vec![
            vec!["1".into(), "2".into(), "3".into()],
            vec!["4".into(), "5".into(), "6".into()],
            vec!["7".into(), "8".into(), "9".into()],
        ];
        assert!(!detect_header(&records));
    }

    #[test]
    fn single_row_never_scores_as_header() {
        let records: Vec<Vec<String>> = vec![vec!["Name".into(), "Age".into()]];
        assert!(!detect_header(&records));
    }

    // -- injection screen --

    fn header_map(names: &[&str]) -> HashMap<usize, String> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (i, n.to_string()))
            .collect()
    }

    #[test]
    fn clean_row_passes() {
        let header = header_map(&["id", "name"]);
        assert!(screen_row(b"1,alice\n", 2, &header).is_none());
    }

    #[test]
    fn formula_cmd_flagged_with_column_name() {
        let header = header_map(&["id", "payload"]);
        let issue = screen_row(b"1,=CMD('calc')\n", 2, &header).unwrap();
        assert_eq!(issue.line, 2);
        assert_eq!(issue.column, "payload");
        assert!(issue.value.contains("=CMD"));
    }

    #[test]
    fn script_tag_flagged() {
        let header = HashMap::new();
        let issue = screen_row(b"x,<script>alert(1)</script>\n", 3, &header).unwrap();
        assert_eq!(issue.line, 3);
        assert_eq!(issue.column, "Column 2");
    }

    #[test]
    fn hyperlink_formula_flagged() {
        let header = header_map(&["a", "b"]);
        assert!(screen_row(b"1,=HYPERLINK(\"http://evil\")\n", 5, &header).is_some());
    }

    #[test]
    fn sum_mention_in_prose_is_not_flagged() {
        // Prose without the literal suspicious sequences never reaches the
        // regex stage.
        let header = header_map(&["note"]);
        assert!(screen_row(b"the sum of parts\n", 2, &header).is_none());
    }

    #[test]
    fn split_handles_quoted_delimiters() {
        let fields = split_csv_line(b"1,\"smith, john\",ok\n");
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[1], "\"smith, john\"");
        assert_eq!(fields[2], "ok");
    }

    #[test]
    fn split_strips_crlf_from_last_field() {
        let fields = split_csv_line(b"a,b\r\n");
        assert_eq!(fields[1], "b");
    }
}
