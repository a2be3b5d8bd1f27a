//! # CLI Interface
//!
//! Defines the command-line argument structure for `quasar-node` using
//! `clap` derive. Three subcommands: `run`, `init` and `version`.
//!
//! Every `run` flag that overlaps the TOML config file wins over it; see
//! [`crate::settings::apply_overrides`].

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// QUASAR permissioned consensus node.
///
/// Joins a permissioned cluster, takes part in leader scheduling, proof of
/// history, transaction forwarding and block propagation, and exposes
/// Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "quasar-node",
    about = "QUASAR permissioned consensus node",
    version,
    propagate_version = true
)]
pub struct QuasarNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the QUASAR node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory, a node key and a default config file.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// Path to the node configuration file (TOML).
    ///
    /// When omitted, the node looks for `config.toml` in the data directory
    /// and falls back to built-in defaults if there is none.
    #[arg(long, short = 'c', env = "QUASAR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Node data directory holding the key file and config.
    #[arg(long, short = 'd', env = "QUASAR_DATA_DIR", default_value = ".quasar")]
    pub data_dir: PathBuf,

    /// Node id advertised to the cluster. Defaults to the base58 public key.
    #[arg(long, env = "QUASAR_NODE_ID")]
    pub node_id: Option<String>,

    /// TCP address to listen on for peer traffic, e.g. `0.0.0.0:8901`.
    #[arg(long, env = "QUASAR_LISTEN")]
    pub listen: Option<String>,

    /// Address advertised to peers when it differs from `--listen`
    /// (NAT, container networking).
    #[arg(long, env = "QUASAR_ADVERTISE")]
    pub advertise: Option<String>,

    /// Bootstrap peers, comma separated.
    #[arg(long, env = "QUASAR_BOOTSTRAP", value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "QUASAR_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Hex-encoded Ed25519 secret key.
    ///
    /// If not provided, the node reads `node.key` from the data directory.
    /// **Never pass this flag in production**; use the key file instead.
    #[arg(long, env = "QUASAR_NODE_KEY", hide_env_values = true)]
    pub node_key: Option<String>,

    /// Log output format.
    #[arg(long, env = "QUASAR_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Path to the data directory to initialize.
    #[arg(long, short = 'd', env = "QUASAR_DATA_DIR", default_value = ".quasar")]
    pub data_dir: PathBuf,

    /// Node id written into the generated config.
    #[arg(long)]
    pub node_id: Option<String>,

    /// Overwrite an existing key file.
    #[arg(long)]
    pub force: bool,
}

/// `--log-format` values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    #[default]
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}
