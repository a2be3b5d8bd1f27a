//! # Settings
//!
//! Config file loading for the node binary. The precedence is:
//!
//! 1. built-in defaults (`NodeConfig::default()`),
//! 2. the TOML file (`--config`, else `<data-dir>/config.toml` if present),
//! 3. CLI flags and `QUASAR_*` environment variables.
//!
//! Tables missing from the file keep their defaults, so a config can be as
//! short as a `[network]` section.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use quasar_protocol::config::{NodeConfig, DEFAULT_METRICS_PORT};
use quasar_protocol::crypto::NodeKeypair;

use crate::cli::RunArgs;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const KEY_FILE_NAME: &str = "node.key";

/// Everything `run` needs that is not part of the protocol config.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSettings {
    pub config: NodeConfig,
    pub metrics_port: u16,
    /// Address peers should dial; `None` means "whatever we bound".
    pub advertise: Option<String>,
}

/// Parse a TOML config file.
pub fn load_file(path: &Path) -> Result<NodeConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

/// Resolve the config file (explicit or data-dir default), apply CLI
/// overrides and validate the result.
pub fn resolve(args: &RunArgs) -> Result<NodeSettings> {
    let explicit = args.config.clone();
    let implicit = args.data_dir.join(CONFIG_FILE_NAME);
    let mut config = match explicit {
        Some(path) => load_file(&path)?,
        None if implicit.exists() => load_file(&implicit)?,
        None => NodeConfig::default(),
    };

    apply_overrides(&mut config, args);
    config.validate().context("config validation failed")?;

    Ok(NodeSettings {
        config,
        metrics_port: args.metrics_port.unwrap_or(DEFAULT_METRICS_PORT),
        advertise: args.advertise.clone(),
    })
}

/// CLI flags and environment variables win over the file.
pub fn apply_overrides(config: &mut NodeConfig, args: &RunArgs) {
    if let Some(node_id) = &args.node_id {
        config.node_id = Some(node_id.clone());
    }
    if let Some(listen) = &args.listen {
        config.network.listen_addr = listen.clone();
    }
    if !args.bootstrap.is_empty() {
        config.network.bootstrap_peers = args.bootstrap.clone();
    }
}

/// Render a config as TOML, for `init`.
pub fn render(config: &NodeConfig) -> Result<String> {
    toml::to_string_pretty(config).context("failed to serialize config")
}

// ---------------------------------------------------------------------------
// Key file
// ---------------------------------------------------------------------------

pub fn key_path(data_dir: &Path) -> PathBuf {
    data_dir.join(KEY_FILE_NAME)
}

/// The node key: `--node-key` if given, else the hex key file in the data
/// directory.
pub fn load_keypair(args: &RunArgs) -> Result<NodeKeypair> {
    if let Some(hex_key) = &args.node_key {
        return NodeKeypair::from_hex(hex_key.trim()).context("invalid --node-key");
    }
    let path = key_path(&args.data_dir);
    let raw = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "failed to read node key {} (run `quasar-node init` first)",
            path.display()
        )
    })?;
    NodeKeypair::from_hex(raw.trim())
        .with_context(|| format!("invalid node key in {}", path.display()))
}

/// Write a secret key as hex, owner-readable only on Unix.
pub fn write_keypair(path: &Path, keypair: &NodeKeypair) -> Result<()> {
    std::fs::write(path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("failed to write node key to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict permissions on {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(data_dir: &Path) -> RunArgs {
        RunArgs {
            data_dir: data_dir.to_path_buf(),
            ..RunArgs::default()
        }
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = resolve(&args(dir.path())).unwrap();
        assert_eq!(settings.config, NodeConfig::default());
        assert_eq!(settings.metrics_port, DEFAULT_METRICS_PORT);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        writeln!(
            file,
            "node_id = \"alpha\"\n\n[schedule]\nslots_per_epoch = 16\n\n[turbine]\nfanout = 8"
        )
        .unwrap();

        let config = resolve(&args(dir.path())).unwrap().config;
        assert_eq!(config.node_id.as_deref(), Some("alpha"));
        assert_eq!(config.schedule.slots_per_epoch, 16);
        assert_eq!(config.turbine.fanout, 8);
        assert_eq!(config.gossip, NodeConfig::default().gossip);
    }

    #[test]
    fn cli_flags_override_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[network]\nlisten_addr = \"0.0.0.0:7000\"\nbootstrap_peers = [\"a:1\"]\n",
        )
        .unwrap();

        let mut run = args(dir.path());
        run.config = Some(path);
        run.listen = Some("127.0.0.1:9000".into());
        run.bootstrap = vec!["b:2".into(), "c:3".into()];
        run.metrics_port = Some(9999);

        let settings = resolve(&run).unwrap();
        assert_eq!(settings.config.network.listen_addr, "127.0.0.1:9000");
        assert_eq!(settings.config.network.bootstrap_peers, vec!["b:2", "c:3"]);
        assert_eq!(settings.metrics_port, 9999);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[schedule]\nslot_duration_ms = 0\n",
        )
        .unwrap();
        assert!(resolve(&args(dir.path())).is_err());
    }

    #[test]
    fn rendered_defaults_parse_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, render(&NodeConfig::default()).unwrap()).unwrap();
        assert_eq!(load_file(&path).unwrap(), NodeConfig::default());
    }

    #[test]
    fn key_file_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = NodeKeypair::from_seed(&[4; 32]);
        write_keypair(&key_path(dir.path()), &keypair).unwrap();

        let loaded = load_keypair(&args(dir.path())).unwrap();
        assert_eq!(loaded.public_key(), keypair.public_key());
    }

    #[test]
    fn missing_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_keypair(&args(dir.path())).is_err());
    }
}
