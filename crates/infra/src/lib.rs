//! Infrastructure layer: store selection and the Postgres adapters.

pub mod config;
pub mod postgres;
pub mod stores;

pub use config::{StoreBackend, StoreConfig};
pub use postgres::{PgUnitOfWork, PostgresStatisticStore, PostgresStatusLedger};
pub use stores::{StoreError, Stores};
