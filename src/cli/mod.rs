//! CLI module for recurrer - command-line interface and subcommands.
//!
//! Provides rule management, due-rule review and ledger listing.

pub mod commands;

pub use commands::Cli;
