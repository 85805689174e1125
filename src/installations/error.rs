use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstallationsErrorCode {
    MissingAppConfigValues,
    NotRegistered,
    InstallationNotFound,
    RequestFailed,
    AppOffline,
    DeletePendingRegistration,
    Internal,
    InvalidArgument,
}

impl InstallationsErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationsErrorCode::MissingAppConfigValues => {
                "installations/missing-app-config-values"
            }
            InstallationsErrorCode::NotRegistered => "installations/not-registered",
            InstallationsErrorCode::InstallationNotFound => "installations/installation-not-found",
            InstallationsErrorCode::RequestFailed => "installations/request-failed",
            InstallationsErrorCode::AppOffline => "installations/app-offline",
            InstallationsErrorCode::DeletePendingRegistration => {
                "installations/delete-pending-registration"
            }
            InstallationsErrorCode::Internal => "installations/internal",
            InstallationsErrorCode::InvalidArgument => "installations/invalid-argument",
        }
    }
}

/// Details of an error response returned by the installations backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerErrorData {
    pub server_code: u16,
    pub server_message: String,
    pub server_status: String,
}

#[derive(Clone, Debug)]
pub struct InstallationsError {
    pub code: InstallationsErrorCode,
    message: String,
    server: Option<ServerErrorData>,
}

impl InstallationsError {
    pub fn new(code: InstallationsErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            server: None,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn server_data(&self) -> Option<&ServerErrorData> {
        self.server.as_ref()
    }

    /// Returns `true` for a `request-failed` error whose HTTP status was `status`.
    pub fn is_server_error(&self, status: u16) -> bool {
        self.code == InstallationsErrorCode::RequestFailed
            && self
                .server
                .as_ref()
                .is_some_and(|server| server.server_code == status)
    }
}

impl Display for InstallationsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for InstallationsError {}

pub type InstallationsResult<T> = Result<T, InstallationsError>;

pub fn missing_app_config_value(value_name: &str) -> InstallationsError {
    InstallationsError::new(
        InstallationsErrorCode::MissingAppConfigValues,
        format!("Missing App configuration value: \"{value_name}\""),
    )
}

pub fn not_registered() -> InstallationsError {
    InstallationsError::new(
        InstallationsErrorCode::NotRegistered,
        "Firebase Installation is not registered.",
    )
}

pub fn installation_not_found() -> InstallationsError {
    InstallationsError::new(
        InstallationsErrorCode::InstallationNotFound,
        "Firebase Installation not found.",
    )
}

pub fn app_offline() -> InstallationsError {
    InstallationsError::new(
        InstallationsErrorCode::AppOffline,
        "Could not process request. Application offline.",
    )
}

pub fn delete_pending_registration() -> InstallationsError {
    InstallationsError::new(
        InstallationsErrorCode::DeletePendingRegistration,
        "Can't delete installation while there is a pending registration request.",
    )
}

pub fn invalid_argument(message: impl Into<String>) -> InstallationsError {
    InstallationsError::new(InstallationsErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> InstallationsError {
    InstallationsError::new(InstallationsErrorCode::Internal, message)
}

/// A `request-failed` error for `request_name` carrying the server's response.
pub fn request_failed(request_name: &str, server: ServerErrorData) -> InstallationsError {
    InstallationsError {
        code: InstallationsErrorCode::RequestFailed,
        message: format!(
            "{request_name} request failed with error \"{} {}: {}\"",
            server.server_code, server.server_status, server.server_message
        ),
        server: Some(server),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_failed_exposes_server_status() {
        let err = request_failed(
            "Create Installation",
            ServerErrorData {
                server_code: 409,
                server_message: "conflict".into(),
                server_status: "ALREADY_EXISTS".into(),
            },
        );
        assert!(err.is_server_error(409));
        assert!(!err.is_server_error(404));
        assert_eq!(
            err.to_string(),
            "Create Installation request failed with error \"409 ALREADY_EXISTS: conflict\" (installations/request-failed)"
        );
        assert!(!internal_error("boom").is_server_error(409));
    }
}
