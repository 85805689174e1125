use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value as JsonValue;

use crate::firestore::constants::DEFAULT_HOST;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::DatabaseId;

use super::rpc_error::map_http_error;

const API_VERSION: &str = "v1";
const EMULATOR_HOST_ENV: &str = "FIRESTORE_EMULATOR_HOST";
const X_GOOG_API_CLIENT_VALUE: &str = concat!("gl-rust/ fire/", env!("CARGO_PKG_VERSION"));

/// Where the client connects to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirestoreSettings {
    pub host: String,
    pub ssl: bool,
    /// `host:port` of a local emulator; overrides `host` and `ssl`.
    pub emulator_host: Option<String>,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            ssl: true,
            emulator_host: None,
        }
    }
}

impl FirestoreSettings {
    /// Scheme and authority requests are sent to, e.g. `https://firestore.googleapis.com`.
    pub fn base_url(&self) -> String {
        match &self.emulator_host {
            Some(host) => format!("http://{host}"),
            None if self.ssl => format!("https://{}", self.host),
            None => format!("http://{}", self.host),
        }
    }
}

/// Transport for unary and server-streaming RPCs with JSON bodies.
///
/// `path` is the resource the RPC acts on (for example
/// `projects/p/databases/(default)/documents`) and `rpc_name` the method,
/// such as `commit`.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn invoke_rpc(
        &self,
        rpc_name: &str,
        path: &str,
        request: JsonValue,
        token: Option<String>,
    ) -> FirestoreResult<JsonValue>;

    /// Invokes a server-streaming RPC and returns every response message.
    async fn invoke_streaming_rpc(
        &self,
        rpc_name: &str,
        path: &str,
        request: JsonValue,
        token: Option<String>,
    ) -> FirestoreResult<Vec<JsonValue>> {
        match self.invoke_rpc(rpc_name, path, request, token).await? {
            JsonValue::Array(responses) => Ok(responses),
            JsonValue::Null => Ok(Vec::new()),
            single => Ok(vec![single]),
        }
    }
}

/// Builds a [`RestConnection`]. Honors `FIRESTORE_EMULATOR_HOST`.
#[derive(Clone, Debug)]
pub struct ConnectionBuilder {
    database_id: DatabaseId,
    settings: FirestoreSettings,
    client: Option<Client>,
}

impl ConnectionBuilder {
    pub fn new(database_id: DatabaseId) -> Self {
        let settings = FirestoreSettings {
            emulator_host: std::env::var(EMULATOR_HOST_ENV).ok(),
            ..FirestoreSettings::default()
        };
        Self {
            database_id,
            settings,
            client: None,
        }
    }

    /// Replaces the settings. An emulator host found in the environment is
    /// kept unless `settings` names one.
    pub fn with_settings(mut self, settings: FirestoreSettings) -> Self {
        let emulator_host = settings.emulator_host.clone().or(self.settings.emulator_host);
        self.settings = FirestoreSettings {
            emulator_host,
            ..settings
        };
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_emulator_host(mut self, host: impl Into<String>) -> Self {
        self.settings.emulator_host = Some(host.into());
        self
    }

    pub fn build(self) -> FirestoreResult<RestConnection> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .build()
                .map_err(|err| internal_error(err.to_string()))?,
        };
        Ok(RestConnection {
            client,
            base_url: self.settings.base_url(),
            database_id: self.database_id,
            next_request_id: AtomicU64::new(0),
        })
    }
}

/// [`Connection`] over the Firestore REST API.
#[derive(Debug)]
pub struct RestConnection {
    client: Client,
    base_url: String,
    database_id: DatabaseId,
    next_request_id: AtomicU64,
}

impl RestConnection {
    pub fn builder(database_id: DatabaseId) -> ConnectionBuilder {
        ConnectionBuilder::new(database_id)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn make_url(&self, rpc_name: &str, path: &str) -> String {
        format!(
            "{}/{API_VERSION}/{}:{rpc_name}",
            self.base_url,
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Connection for RestConnection {
    async fn invoke_rpc(
        &self,
        rpc_name: &str,
        path: &str,
        request: JsonValue,
        token: Option<String>,
    ) -> FirestoreResult<JsonValue> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let url = self.make_url(rpc_name, path);
        log::debug!(target: "firestore", "Sending RPC '{rpc_name}' {request_id}: {url}");

        let mut builder = self
            .client
            .post(&url)
            .header("X-Goog-Api-Client", X_GOOG_API_CLIENT_VALUE)
            .header(
                "google-cloud-resource-prefix",
                self.database_id.canonical_name(),
            )
            .json(&request);
        if let Some(token) = token.as_deref() {
            builder = builder.bearer_auth(token);
        }

        let result = async {
            let response = builder
                .send()
                .await
                .map_err(|err| internal_error(err.to_string()))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|err| internal_error(err.to_string()))?;
            if !status.is_success() {
                return Err(map_http_error(status, &text));
            }
            if text.is_empty() {
                Ok(JsonValue::Null)
            } else {
                serde_json::from_str(&text).map_err(|err| internal_error(err.to_string()))
            }
        }
        .await;

        match &result {
            Ok(_) => log::debug!(target: "firestore", "Received RPC '{rpc_name}' {request_id}"),
            Err(err) => {
                log::warn!(target: "firestore", "RPC '{rpc_name}' {request_id} failed with error: {err}")
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use futures::FutureExt;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::panic::AssertUnwindSafe;

    async fn try_start_server() -> Option<MockServer> {
        AssertUnwindSafe(MockServer::start_async())
            .catch_unwind()
            .await
            .ok()
    }

    fn connection(server: &MockServer) -> RestConnection {
        ConnectionBuilder::new(DatabaseId::default("p"))
            .with_settings(FirestoreSettings {
                host: server.address().to_string(),
                ssl: false,
                emulator_host: None,
            })
            .build()
            .unwrap()
    }

    #[test]
    fn base_url_follows_settings() {
        assert_eq!(
            FirestoreSettings::default().base_url(),
            "https://firestore.googleapis.com"
        );
        let settings = FirestoreSettings {
            emulator_host: Some("localhost:8080".into()),
            ..FirestoreSettings::default()
        };
        assert_eq!(settings.base_url(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn posts_json_with_token_and_client_header() {
        let Some(server) = try_start_server().await else {
            eprintln!("Skipping posts_json_with_token_and_client_header: unable to start mock server");
            return;
        };
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/projects/p/databases/(default)/documents:commit")
                    .header("authorization", "Bearer secret")
                    .header_exists("x-goog-api-client")
                    .json_body(json!({ "writes": [] }));
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({ "commitTime": "2024-01-01T00:00:00Z" }));
            })
            .await;

        let response = connection(&server)
            .invoke_rpc(
                "commit",
                "projects/p/databases/(default)/documents",
                json!({ "writes": [] }),
                Some("secret".into()),
            )
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(response["commitTime"], json!("2024-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn streaming_rpc_splits_array_responses() {
        let Some(server) = try_start_server().await else {
            eprintln!("Skipping streaming_rpc_splits_array_responses: unable to start mock server");
            return;
        };
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/projects/p/databases/(default)/documents:runQuery");
                then.status(200)
                    .json_body(json!([{ "readTime": "2024-01-01T00:00:00Z" }, {}]));
            })
            .await;

        let responses = connection(&server)
            .invoke_streaming_rpc(
                "runQuery",
                "projects/p/databases/(default)/documents",
                json!({}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(responses.len(), 2);
    }

    #[tokio::test]
    async fn maps_error_bodies() {
        let Some(server) = try_start_server().await else {
            eprintln!("Skipping maps_error_bodies: unable to start mock server");
            return;
        };
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(409).json_body(json!({
                    "error": { "code": 409, "message": "Transaction lock timeout", "status": "ABORTED" }
                }));
            })
            .await;

        let err = connection(&server)
            .invoke_rpc("commit", "projects/p/databases/(default)/documents", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Aborted);
        assert_eq!(err.message(), "Transaction lock timeout");
    }
}
