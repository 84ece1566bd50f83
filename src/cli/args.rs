//! CLI argument definitions using clap derive

use crate::error::StrataResult;
use crate::scope::{Caller, Namespace};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Strata - tiered build cache and warm sandbox pools
///
/// Derives content-addressed cache keys, stores payloads in the node-local
/// tier under the right sharing scope, and keeps sandbox pools warm.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the cache key digest of a project's inputs
    Key(KeyArgs),

    /// Show which sharing scope files would be stored under
    Classify(ClassifyArgs),

    /// Store and inspect entries in the node-local cache tier
    Cache(CacheArgs),

    /// Keep warm sandbox pools running in the foreground
    Pool(PoolArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Output format for list-style commands
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Namespace selection shared by cache subcommands
#[derive(clap::Args, Debug, Clone, Default)]
pub struct NamespaceArgs {
    /// Store under this owner's private namespace
    #[arg(long, conflicts_with = "group")]
    pub owner: Option<String>,

    /// Store under this group's namespace
    #[arg(long)]
    pub group: Option<String>,
}

impl NamespaceArgs {
    /// Namespace the flags select; `global` when neither is given
    pub fn namespace(&self) -> StrataResult<Namespace> {
        match (&self.owner, &self.group) {
            (Some(owner), _) => Namespace::owner(owner.clone()),
            (None, Some(group)) => Namespace::group(group.clone()),
            (None, None) => Ok(Namespace::Global),
        }
    }

    /// The local operator, acting as `--owner` (or `$USER`) and a member of `--group`
    pub fn caller(&self) -> Caller {
        let owner = self
            .owner
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "local".to_string());
        let caller = Caller::new(owner);
        match &self.group {
            Some(group) => caller.with_group(group.clone()),
            None => caller,
        }
    }
}

/// Arguments for the key command
#[derive(Parser, Debug)]
pub struct KeyArgs {
    /// Project directory scanned for lockfiles (defaults to current directory)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Extra files to hash, relative to the project directory
    pub files: Vec<PathBuf>,

    /// Include allow-listed environment variables
    #[arg(long)]
    pub env: bool,

    #[command(flatten)]
    pub namespace: NamespaceArgs,

    /// Print the inputs that fed the key
    #[arg(long)]
    pub explain: bool,
}

/// Arguments for the classify command
#[derive(Parser, Debug)]
pub struct ClassifyArgs {
    /// Files to classify
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Declare the files public, distributable material
    #[arg(long, conflicts_with = "group")]
    pub distributable: bool,

    /// Declare the files shared within this group
    #[arg(long)]
    pub group: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Store a file under a logical identity such as pkg/react/18.2.0
    Put {
        identity: String,

        /// File holding the payload
        file: PathBuf,

        /// Declare the payload public, distributable material
        #[arg(long)]
        distributable: bool,

        #[command(flatten)]
        namespace: NamespaceArgs,
    },

    /// Write a cached payload to stdout or a file
    Get {
        identity: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        namespace: NamespaceArgs,
    },

    /// Remove an entry
    Rm {
        identity: String,

        #[command(flatten)]
        namespace: NamespaceArgs,
    },

    /// List entries stored in the tier
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove every entry from the tier
    Purge {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Arguments for the pool command
#[derive(Parser, Debug)]
pub struct PoolArgs {
    #[command(subcommand)]
    pub action: PoolAction,
}

#[derive(Subcommand, Debug)]
pub enum PoolAction {
    /// Warm pools and maintain them until Ctrl-C
    Run {
        /// Categories to run (defaults to every configured category)
        #[arg(short = 'C', long = "category")]
        categories: Vec<String>,

        /// Seconds between maintenance passes (overrides config)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Show the effective settings of each pool
    Show {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value (e.g. cache.claim_timeout_ms 5000)
    Set {
        /// Dotted key path
        key: String,

        /// New value
        value: String,
    },
}
