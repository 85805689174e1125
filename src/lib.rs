//! Client-side data synchronization core for a Firestore-style document database.
//!
//! The [`firestore`] module contains the typed value model, the mutation algebra,
//! query compilation, the cooperative `AsyncQueue` scheduler and the optimistic
//! transaction protocol. The [`installations`] module manages the anonymous
//! installation identity (FID) and its auth tokens.
pub mod firestore;
pub mod installations;
pub mod platform;
pub mod util;
