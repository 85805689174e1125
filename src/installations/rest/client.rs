use std::future::Future;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, Url};

use crate::installations::config::AppConfig;
use crate::installations::constants::{
    INSTALLATIONS_API_URL, INSTALLATIONS_API_URL_ENV, INTERNAL_AUTH_VERSION, SDK_VERSION,
};
use crate::installations::error::{
    internal_error, invalid_argument, request_failed, InstallationsError, InstallationsResult,
    ServerErrorData,
};
use crate::installations::types::{AuthToken, RegisteredInstallation};

use super::{
    convert_auth_token, CreateInstallationRequest, CreateInstallationResponse, ErrorResponse,
    GenerateAuthTokenInstallation, GenerateAuthTokenRequest, GenerateAuthTokenResponse,
    InstallationsClient,
};

/// [`InstallationsClient`] speaking the installations REST API.
#[derive(Clone, Debug)]
pub struct RestClient {
    http: Client,
    base_url: Url,
}

impl RestClient {
    /// Targets `FIREBASE_INSTALLATIONS_API_URL` when set, the production
    /// endpoint otherwise.
    pub fn new() -> InstallationsResult<Self> {
        let base_url = std::env::var(INSTALLATIONS_API_URL_ENV)
            .unwrap_or_else(|_| INSTALLATIONS_API_URL.to_string());
        Self::with_base_url(&base_url)
    }

    pub fn with_base_url(base_url: &str) -> InstallationsResult<Self> {
        let base_url = Url::parse(base_url).map_err(|err| {
            invalid_argument(format!(
                "Invalid installations endpoint '{}': {}",
                base_url, err
            ))
        })?;

        let http = Client::builder()
            .user_agent(format!("firestore-sync-core/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| internal_error(format!("Failed to build HTTP client: {}", err)))?;

        Ok(Self { http, base_url })
    }

    fn installations_endpoint(
        &self,
        config: &AppConfig,
        fid: Option<&str>,
    ) -> InstallationsResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| internal_error("Installations endpoint is not base"))?;
            segments.pop_if_empty();
            segments.extend(["projects", config.project_id.as_str(), "installations"]);
            if let Some(fid) = fid {
                segments.push(fid);
            }
        }
        Ok(url)
    }

    fn base_headers(&self, api_key: &str) -> InstallationsResult<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(3);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("x-goog-api-key"),
            HeaderValue::from_str(api_key).map_err(|err| {
                invalid_argument(format!("Invalid API key header value: {}", err))
            })?,
        );
        Ok(headers)
    }

    fn authorized_headers(
        &self,
        api_key: &str,
        refresh_token: &str,
    ) -> InstallationsResult<HeaderMap> {
        let mut headers = self.base_headers(api_key)?;
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("{} {}", INTERNAL_AUTH_VERSION, refresh_token))
                .map_err(|err| {
                    invalid_argument(format!("Invalid refresh token header: {}", err))
                })?,
        );
        Ok(headers)
    }

    /// Sends once more when the first response is a 5xx.
    async fn send_with_retry<F, Fut>(&self, mut send: F) -> Result<Response, reqwest::Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Response, reqwest::Error>>,
    {
        let response = send().await?;
        if response.status().is_server_error() {
            log::debug!(
                target: "installations",
                "Retrying installations request after status {}",
                response.status()
            );
            return send().await;
        }
        Ok(response)
    }

    async fn request_failed(&self, request_name: &str, response: Response) -> InstallationsError {
        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                return request_failed(
                    request_name,
                    ServerErrorData {
                        server_code: status.as_u16(),
                        server_message: format!("unreadable body: {}", err),
                        server_status: String::new(),
                    },
                );
            }
        };

        let server = match serde_json::from_slice::<ErrorResponse>(&bytes) {
            Ok(body) => ServerErrorData {
                server_code: body.error.code,
                server_message: body.error.message,
                server_status: body.error.status,
            },
            Err(_) => ServerErrorData {
                server_code: status.as_u16(),
                server_message: String::from_utf8_lossy(&bytes).into_owned(),
                server_status: status
                    .canonical_reason()
                    .unwrap_or_default()
                    .to_string(),
            },
        };
        request_failed(request_name, server)
    }
}

#[async_trait]
impl InstallationsClient for RestClient {
    async fn create_installation(
        &self,
        config: &AppConfig,
        fid: &str,
    ) -> InstallationsResult<RegisteredInstallation> {
        let url = self.installations_endpoint(config, None)?;
        let headers = self.base_headers(&config.api_key)?;
        let body = CreateInstallationRequest {
            fid,
            auth_version: INTERNAL_AUTH_VERSION,
            app_id: &config.app_id,
            sdk_version: SDK_VERSION,
        };

        let response = self
            .send_with_retry(|| {
                self.http
                    .post(url.clone())
                    .headers(headers.clone())
                    .json(&body)
                    .send()
            })
            .await
            .map_err(|err| {
                internal_error(format!("Network error creating installation: {}", err))
            })?;

        if response.status().is_success() {
            let parsed = response
                .json::<CreateInstallationResponse>()
                .await
                .map_err(|err| internal_error(format!("Invalid installation response: {}", err)))?;
            return Ok(RegisteredInstallation {
                fid: parsed.fid.unwrap_or_else(|| fid.to_owned()),
                refresh_token: parsed.refresh_token,
                auth_token: convert_auth_token(parsed.auth_token)?,
            });
        }

        Err(self.request_failed("Create Installation", response).await)
    }

    async fn generate_auth_token(
        &self,
        config: &AppConfig,
        fid: &str,
        refresh_token: &str,
    ) -> InstallationsResult<AuthToken> {
        let mut url = self.installations_endpoint(config, Some(fid))?;
        url.path_segments_mut()
            .map_err(|_| internal_error("Installations endpoint is not base"))?
            .push("authTokens:generate");
        let headers = self.authorized_headers(&config.api_key, refresh_token)?;

        let body = GenerateAuthTokenRequest {
            installation: GenerateAuthTokenInstallation {
                app_id: &config.app_id,
                sdk_version: SDK_VERSION,
            },
        };

        let response = self
            .send_with_retry(|| {
                self.http
                    .post(url.clone())
                    .headers(headers.clone())
                    .json(&body)
                    .send()
            })
            .await
            .map_err(|err| internal_error(format!("Network error refreshing token: {}", err)))?;

        if response.status().is_success() {
            let parsed = response
                .json::<GenerateAuthTokenResponse>()
                .await
                .map_err(|err| internal_error(format!("Invalid auth token response: {}", err)))?;
            return convert_auth_token(parsed);
        }

        Err(self.request_failed("Generate Auth Token", response).await)
    }

    async fn delete_installation(
        &self,
        config: &AppConfig,
        fid: &str,
        refresh_token: &str,
    ) -> InstallationsResult<()> {
        let url = self.installations_endpoint(config, Some(fid))?;
        let headers = self.authorized_headers(&config.api_key, refresh_token)?;

        let response = self
            .send_with_retry(|| self.http.delete(url.clone()).headers(headers.clone()).send())
            .await
            .map_err(|err| {
                internal_error(format!("Network error deleting installation: {}", err))
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.request_failed("Delete Installation", response).await)
        }
    }
}
