use crate::config::file::ConfigFile;
use crate::config::generator::generate_config;
use clap::{Parser, Subcommand};
use ordlog::config::{Config, Network};
use ordlog::db::insert_indexer_metadata;
use ordlog::initialize_db;
use ordlog::service::run_service;
use ordlog::utils::Context;
use std::process;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Opts {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Generate a new configuration file
    #[clap(subcommand)]
    Config(ConfigCommand),
    /// Ingest the ord event log and keep the inscription index consistent
    #[clap(subcommand)]
    Service(ServiceCommand),
    /// Perform maintenance operations on the local database
    #[clap(subcommand)]
    Db(OrdlogDbCommand),
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
#[clap(bin_name = "config", aliases = &["config"])]
enum ConfigCommand {
    /// Generate new config
    #[clap(name = "new", bin_name = "new", aliases = &["generate"])]
    New(NewConfig),
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct NewConfig {
    /// Target Regtest network
    #[clap(
        long = "regtest",
        conflicts_with = "testnet",
        conflicts_with = "mainnet"
    )]
    pub regtest: bool,
    /// Target Testnet network
    #[clap(
        long = "testnet",
        conflicts_with = "regtest",
        conflicts_with = "mainnet"
    )]
    pub testnet: bool,
    /// Target Mainnet network
    #[clap(
        long = "mainnet",
        conflicts_with = "testnet",
        conflicts_with = "regtest"
    )]
    pub mainnet: bool,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum ServiceCommand {
    /// Start the ingestion service
    #[clap(name = "start", bin_name = "start")]
    Start(StartCommand),
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct StartCommand {
    /// Target Regtest network
    #[clap(
        long = "regtest",
        conflicts_with = "testnet",
        conflicts_with = "mainnet"
    )]
    pub regtest: bool,
    /// Target Testnet network
    #[clap(
        long = "testnet",
        conflicts_with = "regtest",
        conflicts_with = "mainnet"
    )]
    pub testnet: bool,
    /// Target Mainnet network
    #[clap(
        long = "mainnet",
        conflicts_with = "testnet",
        conflicts_with = "regtest"
    )]
    pub mainnet: bool,
    /// Load config file path
    #[clap(
        long = "config-path",
        conflicts_with = "mainnet",
        conflicts_with = "testnet",
        conflicts_with = "regtest"
    )]
    pub config_path: Option<String>,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum OrdlogDbCommand {
    /// Initialize a new ordlog db and write the version marker
    #[clap(name = "new", bin_name = "new")]
    New(InitDbCommand),
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct InitDbCommand {
    /// Target Regtest network
    #[clap(
        long = "regtest",
        conflicts_with = "testnet",
        conflicts_with = "mainnet"
    )]
    pub regtest: bool,
    /// Target Testnet network
    #[clap(
        long = "testnet",
        conflicts_with = "regtest",
        conflicts_with = "mainnet"
    )]
    pub testnet: bool,
    /// Target Mainnet network
    #[clap(
        long = "mainnet",
        conflicts_with = "testnet",
        conflicts_with = "regtest"
    )]
    pub mainnet: bool,
    /// Load config file path
    #[clap(
        long = "config-path",
        conflicts_with = "mainnet",
        conflicts_with = "testnet",
        conflicts_with = "regtest"
    )]
    pub config_path: Option<String>,
}

pub fn main() {
    let logger = hiro_system_kit::log::setup_logger();
    let _guard = hiro_system_kit::log::setup_global_logger(logger.clone());
    let ctx = Context {
        logger: Some(logger),
        tracer: false,
    };

    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            println!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = handle_command(opts, &ctx) {
        error!(ctx.expect_logger(), "{e}");
        std::thread::sleep(std::time::Duration::from_millis(500));
        process::exit(1);
    }
}

fn handle_command(opts: Opts, ctx: &Context) -> Result<(), String> {
    match opts.command {
        Command::Config(ConfigCommand::New(cmd)) => {
            use std::fs::File;
            use std::io::Write;
            let network = if cmd.regtest {
                Network::Regtest
            } else if cmd.testnet {
                Network::Testnet
            } else {
                Network::Mainnet
            };
            let config_content = generate_config(&network);
            let mut file_path = std::env::current_dir().unwrap_or_else(|e| {
                println!("unable to retrieve current_dir {}", e);
                std::process::exit(1);
            });
            file_path.push("Ordlog.toml");
            let mut file = File::create(&file_path)
                .map_err(|e| format!("unable to open file {}\n{}", file_path.display(), e))?;
            file.write_all(config_content.as_bytes())
                .map_err(|e| format!("unable to write file {}\n{}", file_path.display(), e))?;
            println!("Created file Ordlog.toml");
            Ok(())
        }
        Command::Service(ServiceCommand::Start(cmd)) => {
            let config: Config =
                ConfigFile::default(cmd.regtest, cmd.testnet, cmd.mainnet, &cmd.config_path)?;
            let _ = ctrlc::set_handler(move || {
                println!("Terminating ordlog service");
                std::process::exit(0);
            });
            run_service(&config, ctx).map_err(|e| e.to_string())
        }
        Command::Db(OrdlogDbCommand::New(cmd)) => {
            let config: Config =
                ConfigFile::default(cmd.regtest, cmd.testnet, cmd.mainnet, &cmd.config_path)?;
            let conn = initialize_db(&config, ctx);
            insert_indexer_metadata(&config.network, &conn)?;
            info!(
                ctx.expect_logger(),
                "Database initialized for {}", config.network
            );
            Ok(())
        }
    }
}
