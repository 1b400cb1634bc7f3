//! Process configuration, grounded in `SafeKeeperConf`: a flat struct
//! built from CLI flags with a `defaults` module holding fallback values,
//! reloadable in part on `SIGHUP`.

use std::net::SocketAddr;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;

pub mod defaults {
    pub const DEFAULT_MAX_WAL_SENDERS: usize = 10;
    pub const DEFAULT_WAL_SENDER_TIMEOUT: &str = "60s";
    pub const DEFAULT_LISTEN_REPLICATION_ADDR: &str = "127.0.0.1:5434";
    pub const DEFAULT_LISTEN_HTTP_ADDR: &str = "127.0.0.1:7676";
}

/// How much detail the primary is logging into WAL. Streaming replication
/// needs at least `Replica`; ordered so `WalLevel::Replica <= WalLevel::Logical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum WalLevel {
    Minimal,
    Replica,
    Logical,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "walsender", about = "Stream committed WAL to a connected standby")]
pub struct Args {
    /// Directory containing WAL segments to read from.
    #[arg(long)]
    pub wal_dir: Utf8PathBuf,

    /// Address the replication socket listens on.
    #[arg(long, default_value = defaults::DEFAULT_LISTEN_REPLICATION_ADDR)]
    pub listen_replication: SocketAddr,

    /// Address the monitoring HTTP endpoint listens on.
    #[arg(long, default_value = defaults::DEFAULT_LISTEN_HTTP_ADDR)]
    pub listen_http: SocketAddr,

    /// Maximum number of concurrent standby connections; sizes the slot
    /// table at startup and cannot be changed by a config reload.
    #[arg(long, default_value_t = defaults::DEFAULT_MAX_WAL_SENDERS)]
    pub max_wal_senders: usize,

    /// How long a sender will wait for new WAL before sending a keepalive.
    #[arg(long, default_value = defaults::DEFAULT_WAL_SENDER_TIMEOUT)]
    pub wal_sender_timeout: humantime::Duration,

    /// Update the OS process title with each connection's state.
    #[arg(long, default_value_t = false)]
    pub update_process_title: bool,

    /// This primary's configured `wal_level`; `START_REPLICATION` is
    /// refused fatally below `Replica`.
    #[arg(long, value_enum, default_value_t = WalLevel::Replica)]
    pub wal_level: WalLevel,

    /// Whether the primary is still in crash recovery. `START_REPLICATION`
    /// is refused fatally while this is set.
    #[arg(long, default_value_t = false)]
    pub in_recovery: bool,

    /// Path to a TOML file whose values override the above and are
    /// re-read on SIGHUP.
    #[arg(long)]
    pub config_file: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub wal_dir: Utf8PathBuf,
    pub listen_replication: SocketAddr,
    pub listen_http: SocketAddr,
    pub max_wal_senders: usize,
    pub wal_sender_timeout: Duration,
    pub update_process_title: bool,
    pub wal_level: WalLevel,
    pub in_recovery: bool,
    pub config_file: Option<Utf8PathBuf>,
}

impl From<Args> for SenderConfig {
    fn from(args: Args) -> Self {
        SenderConfig {
            wal_dir: args.wal_dir,
            listen_replication: args.listen_replication,
            listen_http: args.listen_http,
            max_wal_senders: args.max_wal_senders,
            wal_sender_timeout: args.wal_sender_timeout.into(),
            update_process_title: args.update_process_title,
            wal_level: args.wal_level,
            in_recovery: args.in_recovery,
            config_file: args.config_file,
        }
    }
}

impl SenderConfig {
    /// Re-read the subset of configuration that is safe to change without
    /// restarting: everything except `max_wal_senders`, which has already
    /// sized the slot table.
    pub fn reload_from_file(&mut self) -> anyhow::Result<()> {
        let Some(path) = &self.config_file else {
            return Ok(());
        };
        let text = std::fs::read_to_string(path)?;
        let doc = text.parse::<toml_edit::Document>()?;
        if let Some(v) = doc.get("wal_sender_timeout").and_then(|v| v.as_str()) {
            self.wal_sender_timeout = v.parse::<humantime::Duration>()?.into();
        }
        if let Some(v) = doc.get("update_process_title").and_then(|v| v.as_bool()) {
            self.update_process_title = v;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn dummy(wal_dir: Utf8PathBuf) -> SenderConfig {
        SenderConfig {
            wal_dir,
            listen_replication: "127.0.0.1:0".parse().unwrap(),
            listen_http: "127.0.0.1:0".parse().unwrap(),
            max_wal_senders: 4,
            wal_sender_timeout: Duration::from_secs(1),
            update_process_title: false,
            wal_level: WalLevel::Replica,
            in_recovery: false,
            config_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_level_ordering() {
        assert!(WalLevel::Minimal < WalLevel::Replica);
        assert!(WalLevel::Replica < WalLevel::Logical);
    }

    #[test]
    fn reload_from_file_updates_timeout_and_title() {
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = camino::Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let config_path = wal_dir.join("walsender.toml");
        std::fs::write(&config_path, "wal_sender_timeout = \"5s\"\nupdate_process_title = true\n").unwrap();

        let mut config = SenderConfig::dummy(wal_dir);
        config.config_file = Some(config_path);
        config.reload_from_file().unwrap();

        assert_eq!(config.wal_sender_timeout, Duration::from_secs(5));
        assert!(config.update_process_title);
        // max_wal_senders is not in the reloadable subset.
        assert_eq!(config.max_wal_senders, 4);
    }

    #[test]
    fn reload_from_file_without_config_file_is_noop() {
        let mut config = SenderConfig::dummy(Utf8PathBuf::from("/tmp"));
        config.reload_from_file().unwrap();
        assert_eq!(config.wal_sender_timeout, Duration::from_secs(1));
    }
}
