//! Command line interface built on clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use smartfields::NoteId;

/// Generate flashcard fields from prompts that can build on each other.
#[derive(Debug, Parser)]
#[command(name = "smartfields", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Provider calls allowed in flight at once.
    #[arg(long, global = true)]
    pub max_concurrency: Option<usize>,

    /// Retries per field for transient provider errors.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Enable verbose output.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate the smart fields of every note in a batch file.
    Run {
        /// TOML or JSON file with note types and notes.
        #[arg(long)]
        file: PathBuf,

        /// Regenerate fields that already have content.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Only generate this field (and what it reads from).
        #[arg(long, requires = "note")]
        target: Option<String>,

        /// Note to run on; required with --target.
        #[arg(long)]
        note: Option<NoteId>,
    },

    /// Validate every note's prompts without generating anything.
    Check {
        #[arg(long)]
        file: PathBuf,
    },

    /// Run the built-in vocabulary demo with the offline provider.
    Demo,
}
