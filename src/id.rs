//! ID generation utilities for Recurrer
//!
//! Provides functions for generating identifiers for rules and ledger entries.

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a unique rule ID
///
/// Format: `rule-{timestamp_ms}-{random_hex}`
/// Example: `rule-1738300800123-a1b2`
pub fn generate_rule_id() -> String {
    let random: u16 = rand::rng().random();
    format!("rule-{}-{:04x}", now_ms(), random)
}

/// Generate a ledger entry ID
///
/// Format: `txn-{timestamp_ms}-{random_hex}`
pub fn generate_entry_id() -> String {
    let random: u16 = rand::rng().random();
    format!("txn-{}-{:04x}", now_ms(), random)
}

/// Key identifying one scheduled occurrence of a rule.
///
/// Two executions of the same rule for the same `next_run_at` produce the
/// same key, so a ledger can recognise a double materialization.
pub fn occurrence_key(rule_id: &str, scheduled_for: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule_id.as_bytes());
    hasher.update(b"|");
    hasher.update(scheduled_for.timestamp_millis().to_be_bytes());
    let result = hasher.finalize();

    // Truncated to 16 bytes
    hex::encode(&result[..16])
}
