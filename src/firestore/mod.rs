pub mod api;
mod constants;
pub mod core;
pub mod error;
pub mod model;
pub mod remote;
pub mod util;
pub mod value;

pub use api::{
    CollectionReference, DocumentReference, DocumentSnapshot, Firestore, Query, QuerySnapshot,
    SetOptions, Transaction, WriteBatch,
};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
