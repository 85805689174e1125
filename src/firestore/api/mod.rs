mod database;
pub mod field_value;
mod query;
mod reference;
mod snapshot;
mod transaction;
mod user_data_reader;
mod write_batch;

pub use database::Firestore;
pub use field_value::{
    array_remove, array_union, delete_field, increment, increment_double, server_timestamp,
};
pub use query::{Query, QuerySnapshot};
pub use reference::{CollectionReference, DocumentReference};
pub use snapshot::DocumentSnapshot;
pub use transaction::Transaction;
pub use user_data_reader::{ParsedSetData, ParsedUpdateData, SetOptions, UserDataReader};
pub use write_batch::WriteBatch;
