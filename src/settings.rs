//! settings.rs
//! Process-wide constants: paths, device identity, buffering limits,
//! retry and power-cycle tuning. Read-only after startup.

// ---------------------------------------------------------------- misc

/// Software version string, written into every output file header.
pub const SOFTWARE_VERSION: &str = "v0";

// --------------------------------------------------------------- paths

pub const PATH_TO_RUN_NUM_FILE: &str = "core/run_num.txt";
pub const PATH_TO_CALIB: &str = "core/calib";
pub const PATH_TO_CHIP_CONFIG: &str = "core/chipconfig.bmc";
pub const POWER_CYCLE_SCRIPT: &str = "./core/pwrcycle.sh";

pub const OUTPUT_DIR: &str = "output";
pub const LOGS_DIR: &str = "output/logs";
pub const DATA_DIR: &str = "output/data";
pub const RAW_DATA_DIR: &str = "output/data/raw";
pub const SPECIES_DATA_DIR: &str = "output/data/species";

pub const RAW_FILE_STEM: &str = "rawHits";
pub const SPECIES_FILE_STEM: &str = "speciesHits";

// ------------------------------------------------------------- readout

/// IP address of the readout board.
pub const HP_ADDRESS: &str = "192.168.1.157";
/// Chip ID of the sensor we expect to find behind the readout.
pub const CHIP_ID: &str = "J2-W00054";

pub const CHIP_WIDTH: usize = 256;
pub const CHIP_HEIGHT: usize = 256;
pub const CHIP_AREA: usize = CHIP_WIDTH * CHIP_HEIGHT;

/// Connection attempts before giving up on one connect cycle.
pub const CNXT_ATTEMPTS: usize = 5;
/// Seconds between (non-power-cycling) connection attempts.
pub const SEC_BTW_CNXT_ATTEMPTS: u64 = 3;

/// Milliseconds without a hit that abort the readout session.
pub const HIT_TIMEOUT_MS: u64 = 60_000;

// --------------------------------------------------------- power cycle

/// GPIO pin driving the relay.
pub const POWER_CYCLE_PIN: u16 = 0;
/// Seconds to hold power off on the first cycle.
pub const POWER_CYCLE_SECONDS_MIN: u64 = 10;
/// Ceiling for the doubling power-cycle backoff.
pub const POWER_CYCLE_SECONDS_MAX: u64 = 160;

// ----------------------------------------------------------- buffering

/// Element count in the raw-write buffer above which the writer is woken.
pub const RAW_HIT_NOTIF_INC: usize = 1000;

/// Capacity of both raw-hit buffers. Must be at least as large as the
/// driver's internal pixel batch.
pub const MAX_BUFF_EL: usize = 65_536;

/// Soft limit on raw-hit file lines (~5 GB).
pub const MAX_RAW_FILE_LINES: u64 = 203_272_823;
/// Soft limit on species-hit file lines (~5 GB).
pub const MAX_SPECIES_FILE_LINES: u64 = 147_058_823;
