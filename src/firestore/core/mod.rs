mod filter;
mod query;
mod target;
mod transaction;
mod transaction_runner;

pub use filter::{FieldFilter, Operator};
pub use query::{LimitType, Query};
pub use target::{Bound, Direction, OrderBy, Target};
pub use transaction::Transaction;
pub use transaction_runner::{
    run_transaction, SharedTransaction, TransactionOptions, TransactionRunner,
    DEFAULT_MAX_ATTEMPTS,
};
