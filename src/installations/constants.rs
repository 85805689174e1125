pub const INSTALLATIONS_API_URL: &str = "https://firebaseinstallations.googleapis.com/v1";
pub const INSTALLATIONS_API_URL_ENV: &str = "FIREBASE_INSTALLATIONS_API_URL";
pub const INSTALLATIONS_CACHE_DIR_ENV: &str = "FIREBASE_INSTALLATIONS_CACHE_DIR";
pub const INTERNAL_AUTH_VERSION: &str = "FIS_v2";
pub const SDK_VERSION: &str = concat!("r:", env!("CARGO_PKG_VERSION"));

/// How long a registration or token request may stay in progress before
/// another caller takes over.
pub const PENDING_TIMEOUT_MS: u64 = 10_000;

/// Tokens expiring within this window are refreshed before being handed out.
pub const TOKEN_EXPIRATION_BUFFER_MS: u64 = 60 * 60 * 1000;
