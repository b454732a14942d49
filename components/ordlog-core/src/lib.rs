#[macro_use]
extern crate hiro_system_kit;

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate lazy_static;

extern crate serde;

pub extern crate hex;

pub mod backfill;
pub mod config;
pub mod core;
pub mod db;
pub mod ord;
pub mod provider;
pub mod service;
pub mod utils;

use config::Config;
use db::initialize_ordlog_db;
use rusqlite::Connection;
use utils::Context;

pub fn initialize_db(config: &Config, ctx: &Context) -> Connection {
    initialize_ordlog_db(&config.expected_cache_path(), ctx)
}
