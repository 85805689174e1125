//! Installation identity management.
//!
//! An installation is identified by a FID generated on the device and
//! registered with the installations backend, which answers with a refresh
//! token used to mint short-lived auth tokens. [`Installations`] keeps that
//! state in an [`InstallationsPersistence`] and coordinates concurrent
//! callers so each registration and token refresh happens once.
mod api;
mod config;
mod constants;
pub mod error;
mod fid;
mod persistence;
mod rest;
mod types;

pub use api::Installations;
pub use config::AppConfig;
pub use constants::{PENDING_TIMEOUT_MS, TOKEN_EXPIRATION_BUFFER_MS};
pub use error::{InstallationsError, InstallationsErrorCode, InstallationsResult};
pub use fid::{generate_fid, is_valid_fid};
pub use persistence::{FilePersistence, InstallationsPersistence, MemoryPersistence};
pub use rest::{InstallationsClient, RestClient};
pub use types::{AuthToken, InstallationEntry, InstallationToken, RegisteredInstallation, RequestStatus};
