use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_lock::Mutex as AsyncMutex;
use once_cell::sync::Lazy;
use tokio::sync::watch;

use crate::installations::config::AppConfig;
use crate::installations::constants::PENDING_TIMEOUT_MS;
use crate::installations::error::{
    app_offline, delete_pending_registration, installation_not_found, internal_error,
    not_registered, InstallationsResult,
};
use crate::installations::fid::generate_fid;
use crate::installations::persistence::{FilePersistence, InstallationsPersistence};
use crate::installations::rest::{InstallationsClient, RestClient};
use crate::installations::types::{
    has_timed_out, now_ms, AuthToken, InstallationEntry, InstallationToken,
};
use crate::platform::runtime;

/// Serializes entry updates for one app and announces every completed
/// registration or token request.
struct AppChannel {
    lock: AsyncMutex<()>,
    changes: watch::Sender<u64>,
}

static APP_CHANNELS: Lazy<Mutex<HashMap<String, Arc<AppChannel>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn app_channel(app_name: &str) -> Arc<AppChannel> {
    APP_CHANNELS
        .lock()
        .unwrap()
        .entry(app_name.to_string())
        .or_insert_with(|| {
            Arc::new(AppChannel {
                lock: AsyncMutex::new(()),
                changes: watch::channel(0).0,
            })
        })
        .clone()
}

enum Registration {
    Start(String),
    Pending(u64),
    None,
}

enum TokenAction {
    Wait(u64),
    Refresh { fid: String, refresh_token: String },
}

/// Manages the installation id (FID) of one app and the auth tokens issued
/// for it.
///
/// State lives in an [`InstallationsPersistence`]; instances configured for
/// the same app name coordinate through a shared per-app channel, so only one
/// registration or token request is in flight at a time.
#[derive(Clone)]
pub struct Installations {
    inner: Arc<InstallationsInner>,
}

struct InstallationsInner {
    config: AppConfig,
    client: Arc<dyn InstallationsClient>,
    persistence: Arc<dyn InstallationsPersistence>,
    online: AtomicBool,
    channel: Arc<AppChannel>,
}

impl Installations {
    pub fn new(
        config: AppConfig,
        client: Arc<dyn InstallationsClient>,
        persistence: Arc<dyn InstallationsPersistence>,
    ) -> InstallationsResult<Self> {
        config.validate()?;
        let channel = app_channel(&config.app_name);
        Ok(Self {
            inner: Arc::new(InstallationsInner {
                config,
                client,
                persistence,
                online: AtomicBool::new(true),
                channel,
            }),
        })
    }

    /// An instance using [`RestClient::new`] and [`FilePersistence::from_env`].
    pub fn from_env(config: AppConfig) -> InstallationsResult<Self> {
        let client = RestClient::new()?;
        let persistence = FilePersistence::from_env()?;
        Self::new(config, Arc::new(client), Arc::new(persistence))
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// While offline, registrations and token refreshes are not attempted.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Returns the FID, creating one if needed.
    ///
    /// Registration with the backend happens in the background and does not
    /// delay the result; offline, the FID is returned unregistered.
    pub async fn get_id(&self) -> InstallationsResult<String> {
        let (entry, registration) = self.get_installation_entry().await?;
        match registration {
            Registration::Start(fid) => {
                let installations = self.clone();
                runtime::spawn_detached(async move {
                    if let Err(err) = installations.register(fid).await {
                        log::debug!(target: "installations", "Background registration failed: {err}");
                    }
                });
            }
            Registration::Pending(_) => {}
            Registration::None => {
                if matches!(entry, InstallationEntry::Registered { .. }) {
                    let installations = self.clone();
                    runtime::spawn_detached(async move {
                        if let Err(err) = installations.get_token(false).await {
                            log::debug!(target: "installations", "Background token refresh failed: {err}");
                        }
                    });
                }
            }
        }
        Ok(entry.fid().to_string())
    }

    /// Returns an auth token for the installation, registering it first if
    /// needed.
    ///
    /// A cached token is reused unless it expires within the next hour or
    /// `force_refresh` is set.
    pub async fn get_token(&self, force_refresh: bool) -> InstallationsResult<InstallationToken> {
        self.registered_entry().await?;
        let mut waited = false;
        loop {
            let changes = self.inner.channel.changes.subscribe();
            let action = {
                let _guard = self.inner.channel.lock.lock().await;
                let Some(InstallationEntry::Registered {
                    fid,
                    refresh_token,
                    auth_token,
                }) = self.read_entry()?
                else {
                    return Err(not_registered());
                };
                let now = now_ms();
                match &auth_token {
                    AuthToken::Completed { .. }
                        if (!force_refresh || waited) && !auth_token.is_expired(now) =>
                    {
                        return to_installation_token(&auth_token);
                    }
                    AuthToken::InProgress { request_time }
                        if !has_timed_out(*request_time, now) =>
                    {
                        TokenAction::Wait(*request_time)
                    }
                    _ => {
                        if !self.is_online() {
                            return Err(app_offline());
                        }
                        self.write_entry(&InstallationEntry::Registered {
                            fid: fid.clone(),
                            refresh_token: refresh_token.clone(),
                            auth_token: AuthToken::InProgress { request_time: now },
                        })?;
                        TokenAction::Refresh { fid, refresh_token }
                    }
                }
            };
            match action {
                TokenAction::Wait(request_time) => {
                    wait_for_change(changes, request_time).await;
                    waited = true;
                }
                TokenAction::Refresh { fid, refresh_token } => {
                    return self.refresh_auth_token(fid, refresh_token).await;
                }
            }
        }
    }

    /// Deletes the installation on the backend and forgets it locally.
    pub async fn delete(&self) -> InstallationsResult<()> {
        let entry = {
            let _guard = self.inner.channel.lock.lock().await;
            self.read_entry()?
        };
        match entry {
            Some(InstallationEntry::InProgress { .. }) => {
                return Err(delete_pending_registration());
            }
            Some(InstallationEntry::Registered {
                fid, refresh_token, ..
            }) => {
                if !self.is_online() {
                    return Err(app_offline());
                }
                self.inner
                    .client
                    .delete_installation(&self.inner.config, &fid, &refresh_token)
                    .await?;
            }
            Some(InstallationEntry::Unregistered { .. }) | None => {}
        }
        let _guard = self.inner.channel.lock.lock().await;
        self.inner.persistence.clear(&self.inner.config.app_name)?;
        self.announce_change();
        Ok(())
    }

    /// Loads or creates the entry and decides whether this caller starts the
    /// registration.
    async fn get_installation_entry(&self) -> InstallationsResult<(InstallationEntry, Registration)> {
        let _guard = self.inner.channel.lock.lock().await;
        let entry = match self.read_entry()? {
            Some(entry) => entry,
            None => {
                let fid = generate_fid();
                if fid.is_empty() {
                    return Err(internal_error("Could not generate a valid installation id."));
                }
                InstallationEntry::Unregistered { fid }
            }
        };

        let now = now_ms();
        let restart = match &entry {
            InstallationEntry::Unregistered { .. } => true,
            InstallationEntry::InProgress {
                registration_time, ..
            } => {
                let timed_out = has_timed_out(*registration_time, now);
                if timed_out {
                    log::warn!(
                        target: "installations",
                        "Pending registration of {} timed out; starting over",
                        entry.fid()
                    );
                }
                timed_out
            }
            InstallationEntry::Registered { .. } => false,
        };

        let (entry, registration) = if !restart {
            let registration = match &entry {
                InstallationEntry::InProgress {
                    registration_time, ..
                } => Registration::Pending(*registration_time),
                _ => Registration::None,
            };
            (entry, registration)
        } else if !self.is_online() {
            let fid = entry.fid().to_string();
            (InstallationEntry::Unregistered { fid }, Registration::None)
        } else {
            let fid = entry.fid().to_string();
            (
                InstallationEntry::InProgress {
                    fid: fid.clone(),
                    registration_time: now,
                },
                Registration::Start(fid),
            )
        };
        self.write_entry(&entry)?;
        Ok((entry, registration))
    }

    /// Resolves once the installation is registered, registering it or
    /// waiting for another caller's registration as needed.
    async fn registered_entry(&self) -> InstallationsResult<InstallationEntry> {
        loop {
            let changes = self.inner.channel.changes.subscribe();
            let (entry, registration) = self.get_installation_entry().await?;
            match registration {
                Registration::Start(fid) => return self.register(fid).await,
                Registration::Pending(registration_time) => {
                    wait_for_change(changes, registration_time).await;
                }
                Registration::None => {
                    return match entry {
                        InstallationEntry::Registered { .. } => Ok(entry),
                        _ => Err(app_offline()),
                    };
                }
            }
        }
    }

    async fn register(&self, fid: String) -> InstallationsResult<InstallationEntry> {
        log::debug!(target: "installations", "Registering installation {fid}");
        let result = self
            .inner
            .client
            .create_installation(&self.inner.config, &fid)
            .await;

        let _guard = self.inner.channel.lock.lock().await;
        let outcome = match result {
            Ok(registered) => {
                let entry = InstallationEntry::Registered {
                    fid: registered.fid,
                    refresh_token: registered.refresh_token,
                    auth_token: registered.auth_token,
                };
                self.write_entry(&entry).map(|()| entry)
            }
            Err(err) => {
                if err.is_server_error(409) {
                    self.inner.persistence.clear(&self.inner.config.app_name)?;
                } else {
                    self.write_entry(&InstallationEntry::Unregistered { fid })?;
                }
                Err(err)
            }
        };
        self.announce_change();
        outcome
    }

    async fn refresh_auth_token(
        &self,
        fid: String,
        refresh_token: String,
    ) -> InstallationsResult<InstallationToken> {
        log::debug!(target: "installations", "Refreshing auth token for {fid}");
        let result = self
            .inner
            .client
            .generate_auth_token(&self.inner.config, &fid, &refresh_token)
            .await;

        let _guard = self.inner.channel.lock.lock().await;
        let still_current = matches!(
            self.read_entry()?,
            Some(InstallationEntry::Registered { fid: ref current, .. }) if *current == fid
        );
        let outcome = match result {
            Ok(auth_token) if still_current => {
                let token = to_installation_token(&auth_token);
                self.write_entry(&InstallationEntry::Registered {
                    fid,
                    refresh_token,
                    auth_token,
                })?;
                token
            }
            Ok(_) => Err(installation_not_found()),
            Err(err) if err.is_server_error(401) || err.is_server_error(404) => {
                self.inner.persistence.clear(&self.inner.config.app_name)?;
                Err(err)
            }
            Err(err) => {
                if still_current {
                    self.write_entry(&InstallationEntry::Registered {
                        fid,
                        refresh_token,
                        auth_token: AuthToken::NotStarted,
                    })?;
                }
                Err(err)
            }
        };
        self.announce_change();
        outcome
    }

    fn read_entry(&self) -> InstallationsResult<Option<InstallationEntry>> {
        self.inner.persistence.read(&self.inner.config.app_name)
    }

    fn write_entry(&self, entry: &InstallationEntry) -> InstallationsResult<()> {
        self.inner
            .persistence
            .write(&self.inner.config.app_name, entry)
    }

    fn announce_change(&self) {
        self.inner
            .channel
            .changes
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

impl Debug for Installations {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installations")
            .field("config", &self.inner.config)
            .field("online", &self.is_online())
            .finish()
    }
}

/// Waits for the next announced change, or until a request started at
/// `started_ms` would time out.
async fn wait_for_change(mut changes: watch::Receiver<u64>, started_ms: u64) {
    let deadline = started_ms.saturating_add(PENDING_TIMEOUT_MS);
    let remaining = deadline.saturating_sub(now_ms()) + 1;
    let _ = tokio::time::timeout(Duration::from_millis(remaining), changes.changed()).await;
}

fn to_installation_token(auth_token: &AuthToken) -> InstallationsResult<InstallationToken> {
    match auth_token {
        AuthToken::Completed {
            token,
            expires_in,
            creation_time,
        } => Ok(InstallationToken {
            token: token.clone(),
            expires_at_ms: creation_time.saturating_add(*expires_in),
        }),
        _ => Err(internal_error("Auth token is not available.")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installations::constants::TOKEN_EXPIRATION_BUFFER_MS;
    use crate::installations::error::{
        request_failed, InstallationsError, InstallationsErrorCode, ServerErrorData,
    };
    use crate::installations::persistence::MemoryPersistence;
    use crate::installations::types::RegisteredInstallation;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeClient {
        registrations: AtomicUsize,
        token_requests: AtomicUsize,
        deletions: AtomicUsize,
        registration_status: Mutex<Option<u16>>,
        token_status: Mutex<Option<u16>>,
        delay: Option<Duration>,
    }

    fn server_error(request: &str, status: u16) -> InstallationsError {
        request_failed(
            request,
            ServerErrorData {
                server_code: status,
                server_message: "failure".into(),
                server_status: "FAILED".into(),
            },
        )
    }

    #[async_trait]
    impl InstallationsClient for FakeClient {
        async fn create_installation(
            &self,
            _config: &AppConfig,
            fid: &str,
        ) -> InstallationsResult<RegisteredInstallation> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(status) = *self.registration_status.lock().unwrap() {
                return Err(server_error("Create Installation", status));
            }
            Ok(RegisteredInstallation {
                fid: fid.to_string(),
                refresh_token: format!("refresh-{fid}"),
                auth_token: AuthToken::Completed {
                    token: "registration-token".into(),
                    expires_in: 2 * TOKEN_EXPIRATION_BUFFER_MS,
                    creation_time: now_ms(),
                },
            })
        }

        async fn generate_auth_token(
            &self,
            _config: &AppConfig,
            _fid: &str,
            _refresh_token: &str,
        ) -> InstallationsResult<AuthToken> {
            let count = self.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(status) = *self.token_status.lock().unwrap() {
                return Err(server_error("Generate Auth Token", status));
            }
            Ok(AuthToken::Completed {
                token: format!("token-{count}"),
                expires_in: 2 * TOKEN_EXPIRATION_BUFFER_MS,
                creation_time: now_ms(),
            })
        }

        async fn delete_installation(
            &self,
            _config: &AppConfig,
            _fid: &str,
            _refresh_token: &str,
        ) -> InstallationsResult<()> {
            self.deletions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn unique_config() -> AppConfig {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        AppConfig::new(
            format!("installations-{}", COUNTER.fetch_add(1, Ordering::SeqCst)),
            "key",
            "project",
            "app",
        )
    }

    fn setup(client: FakeClient) -> (Installations, Arc<FakeClient>, MemoryPersistence) {
        let client = Arc::new(client);
        let persistence = MemoryPersistence::new();
        let installations = Installations::new(
            unique_config(),
            client.clone(),
            Arc::new(persistence.clone()),
        )
        .unwrap();
        (installations, client, persistence)
    }

    fn stored(installations: &Installations, persistence: &MemoryPersistence) -> Option<InstallationEntry> {
        persistence.read(&installations.config().app_name).unwrap()
    }

    fn registered_entry(fid: &str, auth_token: AuthToken) -> InstallationEntry {
        InstallationEntry::Registered {
            fid: fid.into(),
            refresh_token: "refresh".into(),
            auth_token,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn get_id_returns_same_fid_and_registers_in_background() {
        let (installations, client, persistence) = setup(FakeClient::default());
        let fid = installations.get_id().await.unwrap();
        assert_eq!(installations.get_id().await.unwrap(), fid);

        for _ in 0..50 {
            if matches!(
                stored(&installations, &persistence),
                Some(InstallationEntry::Registered { .. })
            ) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(
            stored(&installations, &persistence).map(|entry| entry.fid().to_string()),
            Some(fid)
        );
    }

    #[tokio::test]
    async fn offline_get_id_defers_registration() {
        let (installations, client, persistence) = setup(FakeClient::default());
        installations.set_online(false);
        let fid = installations.get_id().await.unwrap();
        assert_eq!(
            stored(&installations, &persistence),
            Some(InstallationEntry::Unregistered { fid })
        );
        assert_eq!(client.registrations.load(Ordering::SeqCst), 0);

        let err = installations.get_token(false).await.unwrap_err();
        assert_eq!(err.code, InstallationsErrorCode::AppOffline);
    }

    #[tokio::test]
    async fn get_token_registers_then_caches() {
        let (installations, client, _) = setup(FakeClient::default());
        let token = installations.get_token(false).await.unwrap();
        assert_eq!(token.token, "registration-token");
        assert_eq!(installations.get_token(false).await.unwrap(), token);
        assert_eq!(client.token_requests.load(Ordering::SeqCst), 0);

        let forced = installations.get_token(true).await.unwrap();
        assert_eq!(forced.token, "token-1");
        assert_eq!(client.registrations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_registration() {
        let (installations, client, _) = setup(FakeClient {
            delay: Some(Duration::from_millis(100)),
            ..FakeClient::default()
        });
        let (first, second) = tokio::join!(installations.get_token(false), installations.get_token(false));
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(client.registrations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timed_out_registration_is_restarted() {
        let (installations, client, persistence) = setup(FakeClient::default());
        let app_name = installations.config().app_name.clone();
        persistence
            .write(
                &app_name,
                &InstallationEntry::InProgress {
                    fid: "cAAAAAAAAAAAAAAAAAAAAA".into(),
                    registration_time: now_ms() - PENDING_TIMEOUT_MS - 1_000,
                },
            )
            .unwrap();

        installations.get_token(false).await.unwrap();
        assert_eq!(client.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(
            stored(&installations, &persistence).map(|entry| entry.fid().to_string()),
            Some("cAAAAAAAAAAAAAAAAAAAAA".to_string())
        );
    }

    #[tokio::test]
    async fn registration_conflict_removes_the_entry() {
        let (installations, _, persistence) = setup(FakeClient {
            registration_status: Mutex::new(Some(409)),
            ..FakeClient::default()
        });
        let err = installations.get_token(false).await.unwrap_err();
        assert!(err.is_server_error(409));
        assert!(stored(&installations, &persistence).is_none());
    }

    #[tokio::test]
    async fn other_registration_failures_reset_the_entry() {
        let (installations, _, persistence) = setup(FakeClient {
            registration_status: Mutex::new(Some(500)),
            ..FakeClient::default()
        });
        installations.get_token(false).await.unwrap_err();
        assert!(matches!(
            stored(&installations, &persistence),
            Some(InstallationEntry::Unregistered { .. })
        ));
    }

    #[tokio::test]
    async fn unauthorized_token_refresh_removes_the_entry() {
        let (installations, client, persistence) = setup(FakeClient::default());
        let app_name = installations.config().app_name.clone();
        persistence
            .write(&app_name, &registered_entry("fid", AuthToken::NotStarted))
            .unwrap();
        *client.token_status.lock().unwrap() = Some(401);

        let err = installations.get_token(false).await.unwrap_err();
        assert!(err.is_server_error(401));
        assert!(stored(&installations, &persistence).is_none());
    }

    #[tokio::test]
    async fn failed_token_refresh_keeps_the_installation() {
        let (installations, client, persistence) = setup(FakeClient::default());
        let app_name = installations.config().app_name.clone();
        persistence
            .write(&app_name, &registered_entry("fid", AuthToken::NotStarted))
            .unwrap();
        *client.token_status.lock().unwrap() = Some(503);

        installations.get_token(false).await.unwrap_err();
        assert_eq!(
            stored(&installations, &persistence),
            Some(registered_entry("fid", AuthToken::NotStarted))
        );
    }

    #[tokio::test]
    async fn expiring_tokens_are_refreshed() {
        let (installations, client, persistence) = setup(FakeClient::default());
        let app_name = installations.config().app_name.clone();
        let expiring = AuthToken::Completed {
            token: "old".into(),
            expires_in: TOKEN_EXPIRATION_BUFFER_MS / 2,
            creation_time: now_ms(),
        };
        persistence
            .write(&app_name, &registered_entry("fid", expiring))
            .unwrap();

        installations.set_online(false);
        let err = installations.get_token(false).await.unwrap_err();
        assert_eq!(err.code, InstallationsErrorCode::AppOffline);

        installations.set_online(true);
        let token = installations.get_token(false).await.unwrap();
        assert_eq!(token.token, "token-1");
        assert_eq!(client.token_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn valid_tokens_work_offline() {
        let (installations, client, persistence) = setup(FakeClient::default());
        let app_name = installations.config().app_name.clone();
        let valid = AuthToken::Completed {
            token: "cached".into(),
            expires_in: 2 * TOKEN_EXPIRATION_BUFFER_MS,
            creation_time: now_ms(),
        };
        persistence
            .write(&app_name, &registered_entry("fid", valid))
            .unwrap();
        installations.set_online(false);

        assert_eq!(installations.get_token(false).await.unwrap().token, "cached");
        assert_eq!(client.token_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delete_requires_a_settled_registration() {
        let (installations, client, persistence) = setup(FakeClient::default());
        let app_name = installations.config().app_name.clone();
        persistence
            .write(
                &app_name,
                &InstallationEntry::InProgress {
                    fid: "fid".into(),
                    registration_time: now_ms(),
                },
            )
            .unwrap();
        let err = installations.delete().await.unwrap_err();
        assert_eq!(err.code, InstallationsErrorCode::DeletePendingRegistration);

        persistence
            .write(&app_name, &registered_entry("fid", AuthToken::NotStarted))
            .unwrap();
        installations.delete().await.unwrap();
        assert_eq!(client.deletions.load(Ordering::SeqCst), 1);
        assert!(stored(&installations, &persistence).is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = Installations::new(
            AppConfig::new("app", "", "project", "app-id"),
            Arc::new(FakeClient::default()),
            Arc::new(MemoryPersistence::new()),
        )
        .unwrap_err();
        assert_eq!(err.code, InstallationsErrorCode::MissingAppConfigValues);
    }
}
