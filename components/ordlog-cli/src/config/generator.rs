use ordlog::config::Network;

pub fn generate_config(network: &Network) -> String {
    let network = network.to_string();
    let conf = format!(
        r#"[storage]
working_dir = "ordlog"

[ord]
# Directory the external ord indexer runs in; its per-network
# folder holds inscriptions.txt and log_file_index.txt.
working_dir = "ord"

[network]
mode = "{network}"

[provider]
# Fallback content/metadata provider used to repair skipped blocks.
base_url = "http://localhost:8080"
request_timeout_secs = 60
max_attempts = 3

[resources]
cpu_core_available = 16
backfill_batch_size = 500
cycle_cooldown_secs = 30
compaction_page_size = 10000

[logs]
ingestion_internals = true
"#,
    );
    conf
}
