use ordlog::config::{
    Config, EventLogConfig, LogConfig, Network, ProviderConfig, ResourcesConfig, StorageConfig,
    DEFAULT_BACKFILL_BATCH_SIZE, DEFAULT_COMPACTION_PAGE_SIZE, DEFAULT_CYCLE_COOLDOWN_SECS,
    DEFAULT_PROVIDER_ATTEMPTS, DEFAULT_PROVIDER_TIMEOUT_SECS,
};
use std::fs::File;
use std::io::{BufReader, Read};

#[derive(Deserialize, Debug, Clone)]
pub struct ConfigFile {
    pub storage: StorageConfigFile,
    pub ord: OrdConfigFile,
    pub network: NetworkConfigFile,
    pub provider: ProviderConfigFile,
    pub resources: Option<ResourcesConfigFile>,
    pub logs: Option<LogConfigFile>,
}

impl ConfigFile {
    pub fn from_file_path(file_path: &str) -> Result<Config, String> {
        let file = File::open(file_path)
            .map_err(|e| format!("unable to read file {}\n{:?}", file_path, e))?;
        let mut file_reader = BufReader::new(file);
        let mut file_buffer = vec![];
        file_reader
            .read_to_end(&mut file_buffer)
            .map_err(|e| format!("unable to read file {}\n{:?}", file_path, e))?;

        let config_file: ConfigFile = match toml::from_slice(&file_buffer) {
            Ok(s) => s,
            Err(e) => {
                return Err(format!("Config file malformatted {}", e));
            }
        };
        ConfigFile::from_config_file(config_file)
    }

    pub fn from_config_file(config_file: ConfigFile) -> Result<Config, String> {
        let network = config_file.network.mode.parse::<Network>()?;

        let config = Config {
            storage: StorageConfig {
                working_dir: config_file.storage.working_dir.unwrap_or("ordlog".into()),
            },
            event_log: EventLogConfig {
                ord_working_dir: config_file.ord.working_dir.unwrap_or("ord".into()),
            },
            provider: ProviderConfig {
                base_url: config_file.provider.base_url,
                request_timeout_secs: config_file
                    .provider
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECS),
                max_attempts: config_file
                    .provider
                    .max_attempts
                    .unwrap_or(DEFAULT_PROVIDER_ATTEMPTS),
            },
            resources: ResourcesConfig {
                cpu_core_available: config_file
                    .resources
                    .as_ref()
                    .and_then(|r| r.cpu_core_available)
                    .unwrap_or_else(num_cpus::get),
                backfill_batch_size: config_file
                    .resources
                    .as_ref()
                    .and_then(|r| r.backfill_batch_size)
                    .unwrap_or(DEFAULT_BACKFILL_BATCH_SIZE),
                cycle_cooldown_secs: config_file
                    .resources
                    .as_ref()
                    .and_then(|r| r.cycle_cooldown_secs)
                    .unwrap_or(DEFAULT_CYCLE_COOLDOWN_SECS),
                compaction_page_size: config_file
                    .resources
                    .as_ref()
                    .and_then(|r| r.compaction_page_size)
                    .unwrap_or(DEFAULT_COMPACTION_PAGE_SIZE),
            },
            network,
            logs: LogConfig {
                ingestion_internals: config_file
                    .logs
                    .as_ref()
                    .and_then(|l| l.ingestion_internals)
                    .unwrap_or(true),
            },
        };
        Ok(config)
    }

    pub fn default(
        devnet: bool,
        testnet: bool,
        mainnet: bool,
        config_path: &Option<String>,
    ) -> Result<Config, String> {
        let config = match (devnet, testnet, mainnet, config_path) {
            (true, false, false, _) => Config::devnet_default(),
            (false, true, false, _) => Config::testnet_default(),
            (false, false, true, _) => Config::mainnet_default(),
            (false, false, false, Some(config_path)) => ConfigFile::from_file_path(config_path)?,
            _ => Err("Invalid combination of arguments".to_string())?,
        };
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfigFile {
    pub working_dir: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct OrdConfigFile {
    pub working_dir: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NetworkConfigFile {
    pub mode: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProviderConfigFile {
    pub base_url: String,
    pub request_timeout_secs: Option<u64>,
    pub max_attempts: Option<usize>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ResourcesConfigFile {
    pub cpu_core_available: Option<usize>,
    pub backfill_batch_size: Option<usize>,
    pub cycle_cooldown_secs: Option<u64>,
    pub compaction_page_size: Option<usize>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LogConfigFile {
    pub ingestion_internals: Option<bool>,
}
