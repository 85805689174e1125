use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::installations::constants::{PENDING_TIMEOUT_MS, TOKEN_EXPIRATION_BUFFER_MS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    NotStarted,
    InProgress,
    Completed,
}

/// The stored state of an auth token. Times are milliseconds since the epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "requestStatus", rename_all = "camelCase")]
pub enum AuthToken {
    NotStarted,
    #[serde(rename_all = "camelCase")]
    InProgress { request_time: u64 },
    #[serde(rename_all = "camelCase")]
    Completed {
        token: String,
        expires_in: u64,
        creation_time: u64,
    },
}

impl AuthToken {
    pub fn status(&self) -> RequestStatus {
        match self {
            AuthToken::NotStarted => RequestStatus::NotStarted,
            AuthToken::InProgress { .. } => RequestStatus::InProgress,
            AuthToken::Completed { .. } => RequestStatus::Completed,
        }
    }

    /// A completed token that expires within the refresh buffer counts as
    /// expired.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self {
            AuthToken::Completed {
                expires_in,
                creation_time,
                ..
            } => creation_time.saturating_add(*expires_in) < now_ms + TOKEN_EXPIRATION_BUFFER_MS,
            _ => false,
        }
    }
}

/// The stored state of an installation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "registrationStatus", rename_all = "camelCase")]
pub enum InstallationEntry {
    Unregistered {
        fid: String,
    },
    #[serde(rename_all = "camelCase")]
    InProgress {
        fid: String,
        registration_time: u64,
    },
    #[serde(rename_all = "camelCase")]
    Registered {
        fid: String,
        refresh_token: String,
        auth_token: AuthToken,
    },
}

impl InstallationEntry {
    pub fn fid(&self) -> &str {
        match self {
            InstallationEntry::Unregistered { fid }
            | InstallationEntry::InProgress { fid, .. }
            | InstallationEntry::Registered { fid, .. } => fid,
        }
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            InstallationEntry::Unregistered { .. } => RequestStatus::NotStarted,
            InstallationEntry::InProgress { .. } => RequestStatus::InProgress,
            InstallationEntry::Registered { .. } => RequestStatus::Completed,
        }
    }
}

/// A token handed out to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at_ms: u64,
}

/// The result of a successful registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredInstallation {
    pub fid: String,
    pub refresh_token: String,
    pub auth_token: AuthToken,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Whether a request started at `started_ms` has been pending too long.
pub(crate) fn has_timed_out(started_ms: u64, now_ms: u64) -> bool {
    started_ms.saturating_add(PENDING_TIMEOUT_MS) < now_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_expire_within_the_buffer() {
        let token = AuthToken::Completed {
            token: "t".into(),
            expires_in: 2 * TOKEN_EXPIRATION_BUFFER_MS,
            creation_time: 1_000,
        };
        assert!(!token.is_expired(1_000));
        assert!(token.is_expired(1_000 + TOKEN_EXPIRATION_BUFFER_MS + 1));
        assert!(!AuthToken::NotStarted.is_expired(u64::MAX / 2));
    }

    #[test]
    fn entries_serialize_with_status_tags() {
        let entry = InstallationEntry::Registered {
            fid: "fid".into(),
            refresh_token: "refresh".into(),
            auth_token: AuthToken::InProgress { request_time: 5 },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["registrationStatus"], "registered");
        assert_eq!(json["refreshToken"], "refresh");
        assert_eq!(json["authToken"]["requestStatus"], "inProgress");
        assert_eq!(json["authToken"]["requestTime"], 5);
        let back: InstallationEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn pending_requests_time_out() {
        assert!(!has_timed_out(0, PENDING_TIMEOUT_MS));
        assert!(has_timed_out(0, PENDING_TIMEOUT_MS + 1));
    }
}
