//! Cursor and pagination validation, plus chunk statistics.
//!
//! Cursors address bytes (not code points) in a single execution's stdout.
//! Validation is strict and message-precise: agents retry on exact feedback,
//! so "cursor offset must be a finite non-negative integer" beats a generic
//! schema error.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_LIMIT_BYTES: u64 = 40_000;
pub const MAX_LIMIT_BYTES: u64 = 40_000;
pub const DEFAULT_LIMIT_LINES: u64 = 2_000;
pub const MAX_LIMIT_LINES: u64 = 100_000;

/// A byte-offset cursor. `bytes` is the only cursor type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub cursor_type: &'static str,
    pub offset: u64,
}

impl Cursor {
    pub fn bytes(offset: u64) -> Self {
        Self {
            cursor_type: "bytes",
            offset,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor must be an object with cursor_type and offset")]
    NotAnObject,
    #[error("cursor is missing cursor_type")]
    MissingType,
    #[error("unsupported cursor_type (only \"bytes\" is supported)")]
    UnsupportedType,
    #[error("cursor offset must be a finite non-negative integer")]
    InvalidOffset,
}

/// Validate a JSON cursor value.
pub fn parse_cursor(value: &Value) -> Result<Cursor, CursorError> {
    let object = value.as_object().ok_or(CursorError::NotAnObject)?;
    let cursor_type = object
        .get("cursor_type")
        .ok_or(CursorError::MissingType)?
        .as_str()
        .ok_or(CursorError::UnsupportedType)?;
    if cursor_type != "bytes" {
        return Err(CursorError::UnsupportedType);
    }

    let offset = object
        .get("offset")
        .and_then(Value::as_f64)
        .ok_or(CursorError::InvalidOffset)?;
    if !offset.is_finite() || offset < 0.0 || offset.fract() != 0.0 {
        return Err(CursorError::InvalidOffset);
    }
    Ok(Cursor::bytes(offset as u64))
}

/// A validated pagination request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Cursor,
    pub limit_bytes: u64,
    pub limit_lines: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("page is required and must be an object")]
    MissingPage,
    #[error("page.cursor is required")]
    MissingCursor,
    #[error("invalid cursor: {0}")]
    Cursor(#[from] CursorError),
    #[error("limit_bytes must be an integer between 1 and {MAX_LIMIT_BYTES}")]
    InvalidLimitBytes,
    #[error("limit_lines must be an integer between 1 and {MAX_LIMIT_LINES}")]
    InvalidLimitLines,
}

/// Validate a `shell_exec` pagination object. The object and its cursor are
/// mandatory; limits default when absent and are rejected (not clamped) when
/// out of range.
pub fn parse_page(value: Option<&Value>) -> Result<PageRequest, PageError> {
    let object = value
        .and_then(Value::as_object)
        .ok_or(PageError::MissingPage)?;
    let cursor = parse_cursor(object.get("cursor").ok_or(PageError::MissingCursor)?)?;

    let limit_bytes = match object.get("limit_bytes") {
        None | Some(Value::Null) => DEFAULT_LIMIT_BYTES,
        Some(value) => {
            parse_bounded_int(value, 1, MAX_LIMIT_BYTES).ok_or(PageError::InvalidLimitBytes)?
        }
    };
    let limit_lines = match object.get("limit_lines") {
        None | Some(Value::Null) => DEFAULT_LIMIT_LINES,
        Some(value) => {
            parse_bounded_int(value, 1, MAX_LIMIT_LINES).ok_or(PageError::InvalidLimitLines)?
        }
    };

    Ok(PageRequest {
        cursor,
        limit_bytes,
        limit_lines,
    })
}

fn parse_bounded_int(value: &Value, min: u64, max: u64) -> Option<u64> {
    let number = value.as_f64()?;
    if !number.is_finite() || number.fract() != 0.0 || number < min as f64 || number > max as f64 {
        return None;
    }
    Some(number as u64)
}

/// Best-effort MIME sniff of a returned chunk.
///
/// HTML is tested before generic XML because every HTML document would also
/// satisfy the XML rule.
pub fn sniff_mime(chunk: &str) -> &'static str {
    let trimmed = chunk.trim_start();

    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<serde::de::IgnoredAny>(trimmed).is_ok()
    {
        return "application/json";
    }

    let lowered = trimmed
        .get(..trimmed.len().min(32))
        .unwrap_or("")
        .to_ascii_lowercase();
    if lowered.starts_with("<!doctype html") || lowered.starts_with("<html") {
        return "text/html";
    }
    if trimmed.starts_with('<') && trimmed.contains("</") {
        return "application/xml";
    }

    let first_line = chunk.lines().next().unwrap_or("");
    if first_line.split(',').count() >= 3 {
        return "text/csv";
    }

    if looks_like_yaml(chunk) {
        return "application/yaml";
    }

    "text/plain"
}

fn looks_like_yaml(chunk: &str) -> bool {
    if chunk.contains(';') {
        return false;
    }
    let mut saw_entry = false;
    for line in chunk.lines() {
        let line = line.trim_start();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("- ") || line == "-" || is_yaml_key(line) {
            saw_entry = true;
        } else {
            return false;
        }
    }
    saw_entry
}

fn is_yaml_key(line: &str) -> bool {
    let Some((key, rest)) = line.split_once(':') else {
        return false;
    };
    if key.is_empty() || !(rest.is_empty() || rest.starts_with(' ')) {
        return false;
    }
    key.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Lines in a chunk: LF-delimited segments, with an unterminated trailing
/// segment counting as a line.
pub fn count_lines(chunk: &str) -> u64 {
    if chunk.is_empty() {
        return 0;
    }
    let newlines = chunk.bytes().filter(|b| *b == b'\n').count() as u64;
    if chunk.ends_with('\n') {
        newlines
    } else {
        newlines + 1
    }
}
