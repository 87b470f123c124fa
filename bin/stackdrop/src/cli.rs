use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stackdrop_deploy::config::{ALL_UNITS, CONFIG_FILENAME};
use tracing::level_filters::LevelFilter;

/// How reports are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "stackdrop")]
#[command(
    author,
    version,
    about = "Deploy infrastructure stacks and publish their static assets"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "STACKDROP_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the deployment manifest, or to the directory holding it.
    #[arg(short, long, env = "STACKDROP_CONFIG", default_value = CONFIG_FILENAME)]
    pub config: PathBuf,

    /// How reports are printed.
    #[arg(long, env = "STACKDROP_FORMAT", default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy (or remove) one unit, or every unit with `all`.
    Deploy {
        /// Unit name from the manifest, or `all`.
        #[arg(default_value = ALL_UNITS)]
        target: String,

        /// Deployment stage, e.g. `dev` or `prod`.
        #[arg(short, long, env = "STACKDROP_STAGE")]
        stage: String,

        /// Tear the targets down instead of deploying them.
        #[arg(long)]
        remove: bool,

        /// Targets deployed at once. Overrides the manifest.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Show the live stack status of one unit, or every unit with `all`.
    Status {
        #[arg(default_value = ALL_UNITS)]
        target: String,

        #[arg(short, long, env = "STACKDROP_STAGE")]
        stage: String,
    },

    /// Print the persisted outputs of a unit.
    Outputs {
        target: String,

        #[arg(short, long, env = "STACKDROP_STAGE")]
        stage: String,
    },

    /// Write a starter manifest.
    Init {
        /// Where to write it.
        #[arg(long, default_value = CONFIG_FILENAME)]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}
