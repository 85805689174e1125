use reqwest::StatusCode;
use serde::Deserialize;

use crate::firestore::error::{map_code_from_http_status, FirestoreError, FirestoreErrorCode};

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: Option<GoogleError>,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Converts a failed HTTP response into a [`FirestoreError`].
///
/// The canonical status name in the Google error body takes precedence over
/// the HTTP status, which is only used when the body carries no known name.
pub fn map_http_error(status: StatusCode, body: &str) -> FirestoreError {
    let payload = extract_error_payload(body);
    let message = payload
        .as_ref()
        .and_then(|payload| payload.message.clone())
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("HTTP error").to_string());

    let code = payload
        .as_ref()
        .and_then(|payload| payload.status.as_deref())
        .and_then(FirestoreErrorCode::from_rpc_name)
        .unwrap_or_else(|| map_code_from_http_status(status.as_u16()));

    // A failed response never maps to OK.
    let code = match code {
        FirestoreErrorCode::Ok => FirestoreErrorCode::Unknown,
        other => other,
    };
    FirestoreError::new(code, message)
}

fn extract_error_payload(body: &str) -> Option<GoogleError> {
    serde_json::from_str::<GoogleErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error)
}
