pub mod backoff;
pub mod connection;
pub mod datastore;
mod in_memory;
pub mod rpc_error;
pub mod serializer;

pub use backoff::{BackoffSettings, ExponentialBackoff};
pub use connection::{Connection, ConnectionBuilder, FirestoreSettings, RestConnection};
pub use datastore::{Datastore, DatastoreImpl, NoopTokenProvider, TokenProvider, TokenProviderArc};
pub use in_memory::InMemoryConnection;
pub use rpc_error::map_http_error;
pub use serializer::JsonProtoSerializer;
