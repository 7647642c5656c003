//! Model records and their store

pub mod schema;
pub mod store;

pub use schema::{ModelRecord, ModelStatus, QualityPreference, StatusUpdate, DEFAULT_RETENTION_DAYS};
pub use store::{JsonModelStore, ModelStore, StoreError, StoreResult};
