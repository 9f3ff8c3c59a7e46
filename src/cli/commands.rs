//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - add/list/show/remove/pause/resume: rule management
//! - due: list rules that are due now
//! - review: step through due rules interactively
//! - ledger: list materialized entries

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Recurrer - recurring transaction scheduler
#[derive(Parser, Debug)]
#[command(name = "recurrer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to `due`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a recurrence rule
    Add(AddArgs),

    /// List all rules
    List {
        /// Filter by status (active, paused)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// List rules that are due now
    Due,

    /// Show one rule with its upcoming occurrences
    Show {
        /// Rule ID
        id: String,

        /// Number of upcoming occurrences to list
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Delete a rule
    Remove {
        /// Rule ID
        id: String,
    },

    /// Pause a rule (excluded from due-discovery)
    Pause {
        /// Rule ID
        id: String,
    },

    /// Reactivate a paused rule
    Resume {
        /// Rule ID
        id: String,
    },

    /// Step through due rules: execute, skip, defer or quit
    Review,

    /// List materialized ledger entries
    Ledger {
        /// Only entries for this rule
        #[arg(short, long)]
        rule: Option<String>,
    },
}

/// Arguments for `add`
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Frequency: daily, weekly, monthly or yearly
    #[arg(short, long)]
    pub frequency: String,

    /// Repeat every N units
    #[arg(short, long, default_value_t = 1)]
    pub interval: i64,

    /// Weekday for weekly rules (1 = Monday .. 7 = Sunday)
    #[arg(short, long)]
    pub weekday: Option<i64>,

    /// Day of month for monthly rules (1-31, clamped to short months)
    #[arg(short, long)]
    pub day: Option<i64>,

    /// Monthly rules land on the last day of the month
    #[arg(long)]
    pub last_day: bool,

    /// Transaction amount
    #[arg(short, long, allow_hyphen_values = true)]
    pub amount: f64,

    /// Transaction category
    #[arg(long)]
    pub category: String,

    /// Currency code
    #[arg(long, default_value = "USD")]
    pub currency: String,

    /// Free-form note copied to each entry
    #[arg(long)]
    pub note: Option<String>,

    /// Device name copied to each entry
    #[arg(long)]
    pub device: Option<String>,

    /// First due date (YYYY-MM-DD); defaults to now
    #[arg(long)]
    pub start: Option<NaiveDate>,

    /// Advisory end date (YYYY-MM-DD)
    #[arg(long)]
    pub end: Option<NaiveDate>,

    /// Advisory timezone name stored with the rule
    #[arg(long)]
    pub timezone: Option<String>,
}
