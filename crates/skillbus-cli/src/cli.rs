//! Command-line definitions for the `skillbus` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// skillbus: voice-assistant intent dispatch.
#[derive(Parser, Debug)]
#[command(
    name = "skillbus",
    version,
    about = "skillbus: voice-assistant intent dispatch",
    long_about = "Routes typed utterances through the stop, regex, common-play, \
                  common-query, keyword and fallback stages and prints what the \
                  selected skill says."
)]
pub struct Cli {
    /// Configuration file layered over the defaults. Repeatable; later files win.
    #[arg(long = "config", short = 'c', global = true, value_name = "PATH")]
    pub config: Vec<PathBuf>,

    /// Default language for utterances that carry none.
    #[arg(long, global = true)]
    pub lang: Option<String>,

    /// Session id attached to every utterance.
    #[arg(long, short = 's', global = true, default_value = "default")]
    pub session: String,

    /// Start without the bundled probe skills.
    #[arg(long, global = true)]
    pub no_skills: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start the pipeline and read utterances from stdin.
    Run,

    /// Dispatch a single utterance and exit.
    Say {
        /// Words of the utterance.
        #[arg(required = true, num_args = 1..)]
        words: Vec<String>,
    },

    /// Print the resolved settings and the loaded skills as JSON.
    Status,
}
