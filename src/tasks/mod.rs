//! Background control loops

pub mod reconcile;
pub mod retention;

pub use reconcile::{ReconciliationLoop, TickReport};
pub use retention::{RetentionError, RetentionSweeper, SweepReport};
