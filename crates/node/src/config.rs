//! Node configuration: defaults, config file, `BN_` environment overrides,
//! and command-line flags.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use bn_consensus::{hash256_from_hex, Checkpoint, Network};
use bn_log::{Channel, Format, Level};
use serde::Serialize;

pub const ENVIRONMENT_PREFIX: &str = "BN_";
pub const CONFIG_VARIABLE: &str = "BN_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "bn.conf";

const DEFAULT_THREADS: usize = 4;
const DEFAULT_MAXIMUM_CONCURRENCY: usize = 8;
const DEFAULT_BLOCK_LATENCY_SECS: u64 = 60;
const DEFAULT_INBOUND_CONNECTIONS: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum ThreadPriority {
    Normal,
    Low,
}

impl ThreadPriority {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Mutually exclusive command selectors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Subcommand {
    Help,
    Settings,
    Version,
    Initchain,
    Hardware,
    Newstore,
    Backup,
    Restore,
    Run,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeSettings {
    pub headers_first: bool,
    pub threads: usize,
    pub priority: ThreadPriority,
    pub maximum_concurrency: usize,
    pub delay_inbound: bool,
    pub block_latency_seconds: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct NetworkSettings {
    pub protocol_maximum: i32,
    pub witness_node: bool,
    #[serde(skip)]
    pub checkpoints: Vec<Checkpoint>,
    pub debug_file: Option<PathBuf>,
    pub error_file: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
    pub connect: Vec<String>,
    pub inbound_connections: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct DatabaseSettings {
    pub dir: PathBuf,
    pub cache_mb: u64,
    pub filter: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct BitcoinSettings {
    pub network: String,
    pub subsidy_interval_blocks: Option<u32>,
    pub initial_subsidy: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LogSettings {
    pub level: String,
    pub format: String,
    pub timestamps: bool,
    /// Per-channel toggles by letter.
    pub channels: HashMap<char, bool>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Config {
    #[serde(skip)]
    pub subcommand: Subcommand,
    pub node: NodeSettings,
    pub network: NetworkSettings,
    pub database: DatabaseSettings,
    pub bitcoin: BitcoinSettings,
    pub log: LogSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            subcommand: Subcommand::Run,
            node: NodeSettings {
                headers_first: true,
                threads: DEFAULT_THREADS,
                priority: ThreadPriority::Normal,
                maximum_concurrency: DEFAULT_MAXIMUM_CONCURRENCY,
                delay_inbound: false,
                block_latency_seconds: DEFAULT_BLOCK_LATENCY_SECS,
            },
            network: NetworkSettings {
                protocol_maximum: bn_consensus::constants::PROTOCOL_VERSION,
                witness_node: true,
                checkpoints: Vec::new(),
                debug_file: None,
                error_file: None,
                bind: None,
                connect: Vec::new(),
                inbound_connections: DEFAULT_INBOUND_CONNECTIONS,
            },
            database: DatabaseSettings {
                dir: PathBuf::from("blockchain"),
                cache_mb: 256,
                filter: false,
            },
            bitcoin: BitcoinSettings {
                network: "mainnet".to_string(),
                subsidy_interval_blocks: None,
                initial_subsidy: None,
            },
            log: LogSettings {
                level: "info".to_string(),
                format: "text".to_string(),
                timestamps: true,
                channels: HashMap::new(),
            },
        }
    }
}

impl Config {
    pub fn network(&self) -> Option<Network> {
        Network::parse(&self.bitcoin.network)
    }

    /// Consensus parameters with config overrides applied.
    pub fn chain_params(&self) -> Result<bn_consensus::ChainParams, String> {
        let network = self
            .network()
            .ok_or_else(|| format!("unknown network {}", self.bitcoin.network))?;
        let mut params = bn_consensus::chain_params(network);
        if let Some(interval) = self.bitcoin.subsidy_interval_blocks {
            if interval == 0 {
                return Err("subsidy interval must be nonzero".to_string());
            }
            params.consensus.subsidy_interval_blocks = interval;
        }
        if let Some(subsidy) = self.bitcoin.initial_subsidy {
            params.consensus.initial_subsidy = subsidy;
        }
        if !self.network.checkpoints.is_empty() {
            params.consensus.checkpoints = self.network.checkpoints.clone();
        }
        Ok(params)
    }

    pub fn log_config(&self) -> bn_log::LogConfig {
        let mut config = bn_log::LogConfig {
            level: Level::parse(&self.log.level).unwrap_or(Level::Info),
            format: Format::parse(&self.log.format).unwrap_or(Format::Text),
            timestamps: self.log.timestamps,
            ..Default::default()
        };
        for (letter, enabled) in &self.log.channels {
            if let Some(channel) = Channel::from_letter(*letter) {
                if *enabled {
                    config.channels |= 1 << (channel as u32);
                } else {
                    config.channels &= !(1 << (channel as u32));
                }
            }
        }
        config
    }

    /// Apply one `key=value` setting; dotted group prefix as in the file.
    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        let value = value.trim();
        match key {
            "node.headers_first" => self.node.headers_first = parse_bool(key, value)?,
            "node.threads" => {
                let threads: usize = parse_number(key, value)?;
                if threads == 0 {
                    return Err("node.threads must be at least 1".to_string());
                }
                self.node.threads = threads;
            }
            "node.priority" => {
                self.node.priority = ThreadPriority::parse(value)
                    .ok_or_else(|| format!("invalid thread priority {value}"))?;
            }
            "node.maximum_concurrency" => {
                self.node.maximum_concurrency = parse_number(key, value)?;
            }
            "node.delay_inbound" => self.node.delay_inbound = parse_bool(key, value)?,
            "node.block_latency_seconds" => {
                self.node.block_latency_seconds = parse_number(key, value)?;
            }
            "network.protocol_maximum" => {
                self.network.protocol_maximum = parse_number(key, value)?;
            }
            "network.witness_node" => self.network.witness_node = parse_bool(key, value)?,
            "network.checkpoint" => {
                let (height, hash) = value
                    .split_once(':')
                    .ok_or_else(|| format!("invalid checkpoint {value}, expected height:hash"))?;
                let height = parse_number(key, height)?;
                let hash = hash256_from_hex(hash)
                    .map_err(|err| format!("invalid checkpoint hash: {err}"))?;
                self.network.checkpoints.push(Checkpoint { height, hash });
            }
            "network.debug_file" => self.network.debug_file = Some(PathBuf::from(value)),
            "network.error_file" => self.network.error_file = Some(PathBuf::from(value)),
            "network.bind" => {
                let addr: SocketAddr = value
                    .parse()
                    .map_err(|_| format!("invalid bind address {value}"))?;
                self.network.bind = Some(addr);
            }
            "network.connect" => self.network.connect.push(value.to_string()),
            "network.inbound_connections" => {
                self.network.inbound_connections = parse_number(key, value)?;
            }
            "database.dir" => self.database.dir = PathBuf::from(value),
            "database.cache_mb" => self.database.cache_mb = parse_number(key, value)?,
            "database.filter" => self.database.filter = parse_bool(key, value)?,
            "bitcoin.network" => self.bitcoin.network = value.to_string(),
            "bitcoin.subsidy_interval_blocks" => {
                self.bitcoin.subsidy_interval_blocks = Some(parse_number(key, value)?);
            }
            "bitcoin.initial_subsidy" => {
                self.bitcoin.initial_subsidy = Some(parse_number(key, value)?);
            }
            "log.level" => self.log.level = value.to_string(),
            "log.format" => self.log.format = value.to_string(),
            "log.timestamps" => self.log.timestamps = parse_bool(key, value)?,
            _ => {
                // Single-letter channel toggles: log.a .. log.v.
                if let Some(letter) = key.strip_prefix("log.") {
                    let mut chars = letter.chars();
                    if let (Some(letter), None) = (chars.next(), chars.next()) {
                        if Channel::from_letter(letter).is_some() {
                            self.log.channels.insert(letter, parse_bool(key, value)?);
                            return Ok(());
                        }
                    }
                }
                return Err(format!("unknown setting {key}"));
            }
        }
        Ok(())
    }

    fn apply_file(&mut self, contents: &str) -> Result<(), String> {
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected key=value", number + 1))?;
            self.apply(key.trim(), value)?;
        }
        Ok(())
    }

    fn apply_environment(&mut self) -> Result<(), String> {
        for (name, value) in std::env::vars() {
            let Some(stripped) = name.strip_prefix(ENVIRONMENT_PREFIX) else {
                continue;
            };
            if stripped.eq_ignore_ascii_case("CONFIG") {
                continue;
            }
            // BN_NODE_THREADS maps to node.threads.
            let key = stripped.to_ascii_lowercase().replacen('_', ".", 1);
            self.apply(&key, &value)?;
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("invalid boolean for {key}: {value}")),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("invalid number for {key}: {value}"))
}

pub fn usage() -> String {
    [
        "Usage: bn [subcommand] [--setting value]...",
        "",
        "Subcommands (mutually exclusive):",
        "  help        print this message and exit",
        "  settings    print the effective configuration and exit",
        "  version     print component versions and exit",
        "  initchain   create the archive directory and write the genesis block",
        "  hardware    print CPU feature availability",
        "  newstore    create an empty archive directory",
        "  backup      snapshot the archive directory",
        "  restore     restore the archive directory from its snapshot",
        "",
        "Settings are dotted keys, e.g.:",
        "  --bitcoin.network regtest",
        "  --database.dir /var/lib/bn",
        "  --node.threads 8",
        "  --log.v true",
        "",
        "A config file (bn.conf by default, or $BN_CONFIG) holds the same",
        "keys as key=value lines. Environment variables use the BN_ prefix",
        "with the group separator as the first underscore: BN_NODE_THREADS.",
    ]
    .join("\n")
}

/// Resolve the full configuration: defaults, then file, then environment,
/// then command line.
pub fn load(args: impl IntoIterator<Item = String>) -> Result<Config, String> {
    let mut config = Config::default();

    let path = std::env::var(CONFIG_VARIABLE)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    match std::fs::read_to_string(&path) {
        Ok(contents) => config.apply_file(&contents)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(format!("cannot read {}: {err}", path.display())),
    }

    config.apply_environment()?;
    parse_args(&mut config, args)?;
    Ok(config)
}

fn parse_args(
    config: &mut Config,
    args: impl IntoIterator<Item = String>,
) -> Result<(), String> {
    let mut args = args.into_iter().peekable();

    if let Some(first) = args.peek().map(|value| value.as_str()) {
        let subcommand = match first {
            "help" | "--help" | "-h" => Some(Subcommand::Help),
            "settings" => Some(Subcommand::Settings),
            "version" | "--version" => Some(Subcommand::Version),
            "initchain" => Some(Subcommand::Initchain),
            "hardware" => Some(Subcommand::Hardware),
            "newstore" => Some(Subcommand::Newstore),
            "backup" => Some(Subcommand::Backup),
            "restore" => Some(Subcommand::Restore),
            _ => None,
        };
        if let Some(subcommand) = subcommand {
            config.subcommand = subcommand;
            let _ = args.next();
        }
    }

    while let Some(arg) = args.next() {
        let Some(key) = arg.strip_prefix("--") else {
            return Err(format!("unexpected argument {arg}\n{}", usage()));
        };
        let value = args
            .next()
            .ok_or_else(|| format!("missing value for --{key}\n{}", usage()))?;
        config.apply(key, &value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_args(args: &[&str]) -> Result<Config, String> {
        let mut config = Config::default();
        parse_args(&mut config, args.iter().map(|arg| arg.to_string()))?;
        Ok(config)
    }

    #[test]
    fn defaults_run_the_node() {
        let config = load_args(&[]).expect("config");
        assert_eq!(config.subcommand, Subcommand::Run);
        assert_eq!(config.network(), Some(Network::Mainnet));
        assert!(config.node.headers_first);
    }

    #[test]
    fn subcommands_parse() {
        for (name, expected) in [
            ("help", Subcommand::Help),
            ("settings", Subcommand::Settings),
            ("version", Subcommand::Version),
            ("initchain", Subcommand::Initchain),
            ("hardware", Subcommand::Hardware),
            ("newstore", Subcommand::Newstore),
            ("backup", Subcommand::Backup),
            ("restore", Subcommand::Restore),
        ] {
            assert_eq!(load_args(&[name]).expect("config").subcommand, expected);
        }
    }

    #[test]
    fn settings_override() {
        let config = load_args(&[
            "--bitcoin.network",
            "regtest",
            "--node.threads",
            "2",
            "--node.maximum_concurrency",
            "16",
            "--database.filter",
            "true",
        ])
        .expect("config");
        assert_eq!(config.network(), Some(Network::Regtest));
        assert_eq!(config.node.threads, 2);
        assert_eq!(config.node.maximum_concurrency, 16);
        assert!(config.database.filter);
    }

    #[test]
    fn zero_threads_rejected() {
        assert!(load_args(&["--node.threads", "0"]).is_err());
    }

    #[test]
    fn checkpoint_parses_height_and_hash() {
        let config = load_args(&[
            "--network.checkpoint",
            "11111:0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
        ])
        .expect("config");
        assert_eq!(config.network.checkpoints.len(), 1);
        assert_eq!(config.network.checkpoints[0].height, 11_111);
    }

    #[test]
    fn file_lines_apply_in_order() {
        let mut config = Config::default();
        config
            .apply_file("# comment\nnode.threads=8\nlog.v=true\n\nbitcoin.network=testnet\n")
            .expect("file");
        assert_eq!(config.node.threads, 8);
        assert_eq!(config.log.channels.get(&'v'), Some(&true));
        assert_eq!(config.network(), Some(Network::Testnet));
    }

    #[test]
    fn unknown_keys_rejected() {
        let mut config = Config::default();
        assert!(config.apply("node.bogus", "1").is_err());
    }

    #[test]
    fn log_channel_toggles() {
        let mut config = Config::default();
        config.apply("log.o", "true").expect("toggle");
        config.apply("log.a", "false").expect("toggle");
        let log_config = config.log_config();
        assert_ne!(log_config.channels & (1 << (Channel::Objects as u32)), 0);
        assert_eq!(log_config.channels & (1 << (Channel::Application as u32)), 0);
    }
}
