//! Rule persistence.
//!
//! `RuleStore` is the boundary the scheduler talks to. Two implementations:
//! - **SqliteRuleStore**: append-only JSONL log (source of truth) with a
//!   SQLite index for due-discovery
//! - **MemoryRuleStore**: in-process map for tests and dry runs
//!
//! # Example
//!
//! ```ignore
//! use recurrer::store::{RuleStore, SqliteRuleStore};
//!
//! let store = SqliteRuleStore::open_at("/path/to/data")?;
//! let due = store.list_due(chrono::Utc::now()).await?;
//! ```

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryRuleStore;
pub use sqlite::SqliteRuleStore;
pub use traits::{RuleStore, sort_due};
