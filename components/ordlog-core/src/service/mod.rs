use std::sync::Mutex;
use std::time::Duration;

use crate::config::Config;
use crate::core::errors::IndexerError;
use crate::core::pipeline::run_cycle;
use crate::utils::Context;
use crate::{try_error, try_info, try_warn};

lazy_static! {
    // Single-flight gate: the numbering invariant requires a globally
    // ordered view, so overlapping cycles must never run concurrently.
    static ref CYCLE_GATE: Mutex<()> = Mutex::new(());
}

/// Repeats ingestion cycles on a fixed interval with a cooldown after each
/// completion. Handled failures are logged and retried with fresh input on
/// the next tick; fatal taxonomy members propagate so the process can
/// terminate non-zero after flushing diagnostics.
pub fn run_service(config: &Config, ctx: &Context) -> Result<(), IndexerError> {
    try_info!(
        ctx,
        "Starting ordlog service (network: {}, cooldown: {}s)",
        config.network,
        config.resources.cycle_cooldown_secs
    );
    let inner_ctx = if config.logs.ingestion_internals {
        ctx.clone()
    } else {
        Context::empty()
    };
    loop {
        match CYCLE_GATE.try_lock() {
            Ok(_cycle_guard) => match run_cycle(config, &inner_ctx) {
                Ok(report) if report.nothing_new => {}
                Ok(report) => {
                    try_info!(
                        ctx,
                        "Indexed up to block #{}",
                        report
                            .max_block_height
                            .map(|height| height.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
                Err(e) if e.is_fatal() => {
                    try_error!(ctx, "{}", e);
                    return Err(e);
                }
                Err(e) => {
                    try_warn!(ctx, "Cycle failed ({}), retrying on next tick", e);
                }
            },
            Err(_) => {
                try_warn!(ctx, "Previous cycle still in flight, skipping tick");
            }
        }
        std::thread::sleep(Duration::from_secs(config.resources.cycle_cooldown_secs));
    }
}
