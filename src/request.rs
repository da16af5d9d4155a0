use std::sync::OnceLock;

use regex::Regex;

use crate::error::PipelineError;
use crate::model::TaskMessage;

const MAX_REFERENCE_LENGTH: usize = 2048;

fn correlation_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("static pattern"))
}

/// Task message whose fields have passed the input whitelist. Construction
/// is the only way to get one, so the pipeline can trust these values for
/// file naming and logging.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub correlation_key: String,
    pub pdf_reference: String,
    pub total_pages: Option<u32>,
}

impl ValidatedRequest {
    /// Parse and validate a raw queue message body. Every rejection is a
    /// Validation error (Permanent); malformed input never earns a retry.
    pub fn from_message(body: &[u8]) -> Result<Self, PipelineError> {
        let text = std::str::from_utf8(body)
            .map_err(|err| PipelineError::Validation(format!("message is not UTF-8: {err}")))?;

        let message: TaskMessage = serde_json::from_str(text)
            .map_err(|err| PipelineError::Validation(format!("message is not valid JSON: {err}")))?;

        let correlation_key = message
            .correlation_key
            .ok_or_else(|| PipelineError::Validation("missing field: correlationKey".into()))?;
        let pdf_reference = message
            .pdf_reference
            .ok_or_else(|| PipelineError::Validation("missing field: pdfBlobUrl".into()))?;

        let correlation_key = validate_correlation_key(&correlation_key)?;
        let pdf_reference = validate_reference(&pdf_reference)?;

        if let Some(total_pages) = message.total_pages {
            if total_pages == 0 {
                return Err(PipelineError::Validation("totalPages must be positive".into()));
            }
        }

        Ok(Self {
            correlation_key,
            pdf_reference,
            total_pages: message.total_pages,
        })
    }
}

/// Whitelist validation for the correlation key: it names files and blob
/// paths downstream, so path separators and exotic characters are rejected
/// outright.
pub fn validate_correlation_key(key: &str) -> Result<String, PipelineError> {
    if key.is_empty() {
        return Err(PipelineError::Validation("correlation key is required".into()));
    }
    if !correlation_key_pattern().is_match(key) {
        return Err(PipelineError::Validation(format!(
            "invalid correlation key: must be 1-128 alphanumeric, hyphen, or underscore characters, got {:?}",
            truncate(key, 50)
        )));
    }
    Ok(key.to_string())
}

fn validate_reference(reference: &str) -> Result<String, PipelineError> {
    if reference.trim().is_empty() {
        return Err(PipelineError::Validation("pdf reference is required".into()));
    }
    if reference.len() > MAX_REFERENCE_LENGTH {
        return Err(PipelineError::Validation(format!(
            "pdf reference too long: {} characters (max {MAX_REFERENCE_LENGTH})",
            reference.len()
        )));
    }
    if reference.contains('\0') {
        return Err(PipelineError::Validation("pdf reference contains NUL".into()));
    }
    Ok(reference.to_string())
}

/// Strip any query string before a reference reaches the logs; SAS tokens
/// and signatures ride in query parameters.
pub fn sanitize_reference_for_logging(reference: &str) -> String {
    match reference.split_once('?') {
        Some((base, _)) => base.to_string(),
        None => truncate(reference, 100).to_string(),
    }
}

/// Redact credential-shaped substrings from an error message before it
/// leaves the process in a notification or log line.
pub fn sanitize_error_message(message: &str) -> String {
    static ACCOUNT_KEY: OnceLock<Regex> = OnceLock::new();
    static API_KEY: OnceLock<Regex> = OnceLock::new();
    static LONG_TOKEN: OnceLock<Regex> = OnceLock::new();

    let account_key = ACCOUNT_KEY
        .get_or_init(|| Regex::new(r"AccountKey=[^;]+").expect("static pattern"));
    let api_key = API_KEY.get_or_init(|| {
        Regex::new(r#"(?i)api[_-]?key["\s:=]+[A-Za-z0-9]+"#).expect("static pattern")
    });
    let long_token =
        LONG_TOKEN.get_or_init(|| Regex::new(r"\b[A-Za-z0-9]{40,}\b").expect("static pattern"));

    let sanitized = account_key.replace_all(message, "AccountKey=***REDACTED***");
    let sanitized = api_key.replace_all(&sanitized, "api_key=***REDACTED***");
    long_token.replace_all(&sanitized, "***REDACTED***").into_owned()
}

fn truncate(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_message() {
        let body = br#"{"correlationKey": "task-001_A", "pdfBlobUrl": "input/combined.pdf", "totalPages": 6}"#;
        let request = ValidatedRequest::from_message(body).unwrap();
        assert_eq!(request.correlation_key, "task-001_A");
        assert_eq!(request.pdf_reference, "input/combined.pdf");
        assert_eq!(request.total_pages, Some(6));
    }

    #[test]
    fn accepts_snake_case_aliases() {
        let body = br#"{"correlation_key": "abc", "pdf_blob_url": "input/a.pdf"}"#;
        let request = ValidatedRequest::from_message(body).unwrap();
        assert_eq!(request.correlation_key, "abc");
    }

    #[test]
    fn rejects_malformed_json_and_missing_fields() {
        assert!(ValidatedRequest::from_message(b"not json").is_err());
        assert!(ValidatedRequest::from_message(br#"{"pdfBlobUrl": "a.pdf"}"#).is_err());
        assert!(ValidatedRequest::from_message(br#"{"correlationKey": "abc"}"#).is_err());
    }

    #[test]
    fn rejects_path_traversal_in_correlation_key() {
        assert!(validate_correlation_key("../etc/passwd").is_err());
        assert!(validate_correlation_key("a/b").is_err());
        assert!(validate_correlation_key("").is_err());
        assert!(validate_correlation_key(&"x".repeat(129)).is_err());
        assert!(validate_correlation_key("Task_42-final").is_ok());
    }

    #[test]
    fn rejects_zero_total_pages() {
        let body = br#"{"correlationKey": "abc", "pdfBlobUrl": "a.pdf", "totalPages": 0}"#;
        assert!(ValidatedRequest::from_message(body).is_err());
    }

    #[test]
    fn sanitizes_query_strings_from_references() {
        let sanitized =
            sanitize_reference_for_logging("https://acct.blob.example/input/a.pdf?sig=SECRET");
        assert_eq!(sanitized, "https://acct.blob.example/input/a.pdf");
    }

    #[test]
    fn redacts_credentials_from_error_messages() {
        let message = "upload failed: AccountKey=abc123;EndpointSuffix=core api_key: DEADBEEF";
        let sanitized = sanitize_error_message(message);
        assert!(sanitized.contains("AccountKey=***REDACTED***"));
        assert!(!sanitized.contains("abc123"));
        assert!(!sanitized.contains("DEADBEEF"));
    }

    #[test]
    fn redacts_long_opaque_tokens() {
        let token = "A".repeat(48);
        let sanitized = sanitize_error_message(&format!("token {token} leaked"));
        assert!(!sanitized.contains(&token));
        assert!(sanitized.contains("***REDACTED***"));
    }
}
