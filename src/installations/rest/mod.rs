use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::installations::config::AppConfig;
use crate::installations::error::{invalid_argument, InstallationsResult};
use crate::installations::types::{now_ms, AuthToken, RegisteredInstallation};

mod client;

pub use client::RestClient;

/// The backend operations the installation manager depends on.
#[async_trait]
pub trait InstallationsClient: Send + Sync + 'static {
    async fn create_installation(
        &self,
        config: &AppConfig,
        fid: &str,
    ) -> InstallationsResult<RegisteredInstallation>;

    async fn generate_auth_token(
        &self,
        config: &AppConfig,
        fid: &str,
        refresh_token: &str,
    ) -> InstallationsResult<AuthToken>;

    async fn delete_installation(
        &self,
        config: &AppConfig,
        fid: &str,
        refresh_token: &str,
    ) -> InstallationsResult<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstallationRequest<'a> {
    fid: &'a str,
    auth_version: &'static str,
    app_id: &'a str,
    sdk_version: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstallationResponse {
    refresh_token: String,
    auth_token: GenerateAuthTokenResponse,
    fid: Option<String>,
}

#[derive(Serialize)]
struct GenerateAuthTokenRequest<'a> {
    installation: GenerateAuthTokenInstallation<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAuthTokenInstallation<'a> {
    app_id: &'a str,
    sdk_version: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAuthTokenResponse {
    token: String,
    expires_in: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: u16,
    message: String,
    status: String,
}

fn convert_auth_token(response: GenerateAuthTokenResponse) -> InstallationsResult<AuthToken> {
    Ok(AuthToken::Completed {
        token: response.token,
        expires_in: parse_expires_in(&response.expires_in)?,
        creation_time: now_ms(),
    })
}

/// Parses a duration such as `"604800s"` into milliseconds.
fn parse_expires_in(raw: &str) -> InstallationsResult<u64> {
    let stripped = raw
        .strip_suffix('s')
        .ok_or_else(|| invalid_argument(format!("Invalid expiresIn format: {}", raw)))?;
    let seconds: u64 = stripped
        .parse()
        .map_err(|err| invalid_argument(format!("Invalid expiresIn value '{}': {}", raw, err)))?;
    Ok(seconds.saturating_mul(1000))
}
