use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

pub const DB_VERSION: u32 = 1;
pub const INDEXER_VERSION: u32 = 1;
/// Version of the external `ord` indexer whose log grammar this pipeline
/// understands. Checked by the caller before a cycle consumes its output.
pub const EXPECTED_ORD_VERSION: &str = "0.18.5";

pub const DEFAULT_CYCLE_COOLDOWN_SECS: u64 = 30;
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_PROVIDER_ATTEMPTS: usize = 3;
pub const DEFAULT_BACKFILL_BATCH_SIZE: usize = 500;
pub const DEFAULT_COMPACTION_PAGE_SIZE: usize = 10_000;
/// Malformed lines tolerated per cycle before the stream is considered
/// systemically corrupted.
pub const DEFAULT_MAX_DECODE_ERRORS: usize = 128;

pub const EVENT_LOG_FILE: &str = "inscriptions.txt";
pub const BLOCK_INDEX_LOG_FILE: &str = "log_file_index.txt";
pub const NUL_SIDE_CHANNEL_FILE: &str = "nul_content.log";

#[derive(Clone, Debug)]
pub struct Config {
    pub storage: StorageConfig,
    pub event_log: EventLogConfig,
    pub provider: ProviderConfig,
    pub resources: ResourcesConfig,
    pub network: Network,
    pub logs: LogConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    /// Height below which the chain carries no inscriptions this index
    /// tracks; the reorg detector never looks beneath it.
    pub fn first_inscription_height(&self) -> u64 {
        match self {
            Network::Mainnet => 856_450,
            Network::Testnet => 2_413_343,
            Network::Signet => 112_402,
            Network::Regtest => 0,
        }
    }

    /// Subdirectory the external indexer writes its logs into.
    pub fn folder_name(&self) -> &str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet3",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Network::Mainnet => "mainnet",
                Network::Testnet => "testnet",
                Network::Signet => "signet",
                Network::Regtest => "regtest",
            }
        )
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(format!("unknown network type: {s}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub working_dir: String,
}

#[derive(Clone, Debug)]
pub struct EventLogConfig {
    /// Directory the external indexer runs in; its per-network folder holds
    /// both log files.
    pub ord_working_dir: String,
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_attempts: usize,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ResourcesConfig {
    pub cpu_core_available: usize,
    pub backfill_batch_size: usize,
    pub cycle_cooldown_secs: u64,
    pub compaction_page_size: usize,
}

impl ResourcesConfig {
    pub fn get_optimal_thread_pool_capacity(&self) -> usize {
        // One thread feeds the pool, another handles the reduce step.
        self.cpu_core_available.saturating_sub(2).max(1)
    }
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub ingestion_internals: bool,
}

impl Config {
    pub fn expected_cache_path(&self) -> PathBuf {
        let mut destination_path = PathBuf::new();
        destination_path.push(&self.storage.working_dir);
        destination_path
    }

    pub fn expected_event_log_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        path.push(&self.event_log.ord_working_dir);
        path.push(self.network.folder_name());
        path.push(EVENT_LOG_FILE);
        path
    }

    pub fn expected_block_index_log_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        path.push(&self.event_log.ord_working_dir);
        path.push(self.network.folder_name());
        path.push(BLOCK_INDEX_LOG_FILE);
        path
    }

    pub fn expected_nul_side_channel_path(&self) -> PathBuf {
        let mut path = self.expected_cache_path();
        path.push(NUL_SIDE_CHANNEL_FILE);
        path
    }

    pub fn first_inscription_height(&self) -> u64 {
        self.network.first_inscription_height()
    }

    pub fn devnet_default() -> Config {
        Config::default_with_network(Network::Regtest)
    }

    pub fn testnet_default() -> Config {
        Config::default_with_network(Network::Testnet)
    }

    pub fn mainnet_default() -> Config {
        Config::default_with_network(Network::Mainnet)
    }

    fn default_with_network(network: Network) -> Config {
        Config {
            storage: StorageConfig {
                working_dir: default_cache_path(),
            },
            event_log: EventLogConfig {
                ord_working_dir: default_ord_working_dir(),
            },
            provider: ProviderConfig {
                base_url: "http://localhost:8080".into(),
                request_timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
                max_attempts: DEFAULT_PROVIDER_ATTEMPTS,
            },
            resources: ResourcesConfig {
                cpu_core_available: num_cpus::get(),
                backfill_batch_size: DEFAULT_BACKFILL_BATCH_SIZE,
                cycle_cooldown_secs: DEFAULT_CYCLE_COOLDOWN_SECS,
                compaction_page_size: DEFAULT_COMPACTION_PAGE_SIZE,
            },
            network,
            logs: LogConfig {
                ingestion_internals: true,
            },
        }
    }
}

pub fn default_cache_path() -> String {
    let mut cache_path = std::env::current_dir().expect("unable to get current dir");
    cache_path.push("ordlog");
    format!("{}", cache_path.display())
}

pub fn default_ord_working_dir() -> String {
    let mut ord_path = std::env::current_dir().expect("unable to get current dir");
    ord_path.push("ord");
    format!("{}", ord_path.display())
}
