//! power.rs
//! Relay-based power cycle of the readout, delegated to an external
//! script so the GPIO wiring stays out of this process.

use std::process::Command;

use crate::logging::{LogLevel, Logger};
use crate::settings::{POWER_CYCLE_PIN, POWER_CYCLE_SCRIPT};

/// Spawns `pwrcycle.sh <pin> <seconds>` and waits for it. Failures are
/// logged and swallowed; the caller retries the acquisition either way.
pub fn power_cycle(logger: &Logger, seconds: u64) {
    logger.log(
        LogLevel::Info,
        &format!(
            "power cycling readout for {} s (relay pin {})",
            seconds, POWER_CYCLE_PIN
        ),
    );

    let status = Command::new(POWER_CYCLE_SCRIPT)
        .arg(POWER_CYCLE_PIN.to_string())
        .arg(seconds.to_string())
        .status();

    match status {
        Ok(status) if status.success() => {
            logger.log(LogLevel::Info, "power cycle complete");
        }
        Ok(status) => {
            logger.log(
                LogLevel::Error,
                &format!("power cycle script exited with {}", status),
            );
        }
        Err(e) => {
            logger.log_error(LogLevel::Error, "failed to spawn power cycle script", &e);
        }
    }
}
