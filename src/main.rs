//! Entry point for the SPRINT3 acquisition application.
//!
//! Wires the pipeline — acquisition controller, two bounded raw-hit
//! buffers, processor, species queue, storage workers, run log — then
//! supervises the readout session, power-cycling the device with an
//! exponential backoff whenever it fails. Worker threads stay up across
//! retries within a run.
//!
//! Usage: `sprint <acq_time_seconds> [-v]`

mod acquisition;
mod buffers;
mod logging;
mod power;
mod processing;
mod run_number;
mod settings;
mod storage;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{LevelFilter, error, info};

use acquisition::AcqController;
use acquisition::device::PixelHit;
use buffers::{HitBuffer, SpeciesQueue};
use logging::{LogLevel, Logger, SharedLogger, unix_now};
use processing::DataProcessor;
use settings::{
    LOGS_DIR, PATH_TO_CALIB, PATH_TO_RUN_NUM_FILE, POWER_CYCLE_SECONDS_MAX,
    POWER_CYCLE_SECONDS_MIN, RAW_DATA_DIR,
};
use storage::StorageManager;

fn main() -> ExitCode {
    let Some(args) = CliArgs::parse(std::env::args().skip(1)) else {
        println!("Error parsing command line arguments!");
        println!("Should take the form:");
        println!("sprint <acq_time_seconds> [-v (for verbose)]");
        return ExitCode::FAILURE;
    };

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    println!("Acquisition Time Setting = {} s", args.acq_time_secs);
    println!(
        "Print statements {}",
        if args.verbose { "ON" } else { "OFF" }
    );

    run(&args)
}

struct CliArgs {
    acq_time_secs: u64,
    verbose: bool,
}

impl CliArgs {
    /// One required positional integer; any further token turns on
    /// verbose printing.
    fn parse(mut args: impl Iterator<Item = String>) -> Option<Self> {
        let acq_time_secs = args.next()?.parse().ok()?;
        let verbose = args.next().is_some();
        Some(Self {
            acq_time_secs,
            verbose,
        })
    }
}

fn run(args: &CliArgs) -> ExitCode {
    if let Err(e) = run_number::create_output_dirs() {
        error!("failed to create output directories: {}", e);
        return ExitCode::FAILURE;
    }

    let run_num = match run_number::update_run_number(
        Path::new(PATH_TO_RUN_NUM_FILE),
        Path::new(RAW_DATA_DIR),
    ) {
        Ok(run_num) => run_num,
        Err(e) => {
            error!("failed to update run number: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("starting run {}", run_num);

    let log_level = if args.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_path = format!("{}/log_run{}.txt", LOGS_DIR, run_num);
    let logger: SharedLogger = match Logger::create(Path::new(&log_path), log_level) {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            error!("could not open log file {}: {}", log_path, e);
            return ExitCode::FAILURE;
        }
    };

    // shared channels between the acquisition callbacks and the workers
    let raw_hits: Arc<HitBuffer<PixelHit>> = Arc::new(HitBuffer::new());
    let raw_hits_to_write: Arc<HitBuffer<PixelHit>> = Arc::new(HitBuffer::new());
    let species = Arc::new(SpeciesQueue::new());

    let mut acq_ctrl = AcqController::new(
        raw_hits.clone(),
        raw_hits_to_write.clone(),
        logger.clone(),
    );

    // the processor must be dropped (and drained) before the storage
    // manager so every species hit reaches the queue while the species
    // writer is still running
    let mut storage_mngr = StorageManager::new(
        run_num.clone(),
        species.clone(),
        raw_hits_to_write.clone(),
        logger.clone(),
    );
    let mut data_proc = DataProcessor::new(raw_hits.clone(), species.clone(), logger.clone());

    println!("\nLoading energy calibration files...");
    if let Err(e) = data_proc.load_energy_calib(Path::new(PATH_TO_CALIB)) {
        logger.log_error(LogLevel::Fatal, "energy calibration failed", &e);
        error!("energy calibration failed: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = acq_ctrl.load_config(args.acq_time_secs) {
        error!("configuration failed: {}", e);
        return ExitCode::FAILURE;
    }

    println!("\nLaunching threads...");
    match acq_ctrl.config() {
        Some(config) => storage_mngr.gen_header(unix_now(), config),
        None => {
            logger.log(LogLevel::Fatal, "no configuration to write headers from");
            return ExitCode::FAILURE;
        }
    }
    storage_mngr.launch();
    data_proc.launch();
    thread::sleep(Duration::from_secs(1)); // give threads time to launch

    println!("\nLaunching acquisition...");
    let mut backoff_secs = POWER_CYCLE_SECONDS_MIN;
    loop {
        let outcome = acq_ctrl
            .connect()
            .and_then(|_| acq_ctrl.run_acquisition());
        match outcome {
            Ok(()) => break,
            Err(e) => {
                logger.log_error(LogLevel::Error, "acquisition attempt failed", &e);
                error!("acquisition attempt failed: {}", e);
                power::power_cycle(&logger, backoff_secs);
                backoff_secs = (backoff_secs * 2).min(POWER_CYCLE_SECONDS_MAX);
            }
        }
    }

    // teardown order matters: processor first, storage second, log last
    drop(data_proc);
    drop(storage_mngr);
    logger.log(LogLevel::Info, "run complete");
    info!("run {} complete", run_num);
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::CliArgs;

    fn parse(tokens: &[&str]) -> Option<CliArgs> {
        CliArgs::parse(tokens.iter().map(|t| t.to_string()))
    }

    #[test]
    fn positional_acq_time_is_required() {
        assert!(parse(&[]).is_none());
        assert!(parse(&["sixty"]).is_none());

        let args = parse(&["60"]).unwrap();
        assert_eq!(args.acq_time_secs, 60);
        assert!(!args.verbose);
    }

    #[test]
    fn any_second_token_enables_verbose() {
        assert!(parse(&["60", "-v"]).unwrap().verbose);
        assert!(parse(&["60", "whatever"]).unwrap().verbose);
    }
}
