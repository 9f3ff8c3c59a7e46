//! Recurrer - recurring-transaction scheduling
//!
//! Turns declarative recurrence rules into concrete next-occurrence instants,
//! discovers rules that are due, and drives a review session that
//! materializes ledger entries and re-arms each rule's schedule.

pub mod calculator;
pub mod clock;
pub mod domain;
pub mod error;
pub mod id;
pub mod ledger;
pub mod session;
pub mod store;

pub use calculator::{compute_next_run_at, upcoming};
pub use error::{Result, SchedulerError};
