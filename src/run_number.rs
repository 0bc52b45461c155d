//! run_number.rs
//! Output-directory bootstrap and run-number bookkeeping. The run number
//! lives in a plaintext file; if it is missing or corrupt the highest
//! run number already present in the raw data directory is recovered
//! instead.

use std::fs;
use std::io;
use std::path::Path;

use regex::Regex;

use crate::settings::{DATA_DIR, LOGS_DIR, OUTPUT_DIR, RAW_DATA_DIR, SPECIES_DATA_DIR};

/// Creates the output tree if any part of it is absent.
pub fn create_output_dirs() -> io::Result<()> {
    for dir in [OUTPUT_DIR, LOGS_DIR, DATA_DIR, RAW_DATA_DIR, SPECIES_DATA_DIR] {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Determines the run number for this invocation and writes it back to
/// `run_num_file` before returning it.
pub fn update_run_number(run_num_file: &Path, raw_dir: &Path) -> io::Result<String> {
    let next = match read_last_run(run_num_file) {
        Some(last) => last + 1,
        None => scan_raw_dir(raw_dir) + 1,
    };
    let run_number = next.to_string();
    fs::write(run_num_file, &run_number)?;
    Ok(run_number)
}

fn read_last_run(run_num_file: &Path) -> Option<u64> {
    let text = fs::read_to_string(run_num_file).ok()?;
    text.trim().parse().ok()
}

/// Highest run number present in the raw output files, 0 if none match.
fn scan_raw_dir(raw_dir: &Path) -> u64 {
    let pattern = match Regex::new(r"^rawHits_RN-(\d+)_FN-\d+\.txt$") {
        Ok(re) => re,
        Err(_) => return 0,
    };

    let entries = match fs::read_dir(raw_dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut max_num = 0u64;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(captures) = pattern.captures(name) {
            if let Ok(num) = captures[1].parse::<u64>() {
                max_num = max_num.max(num);
            }
        }
    }
    max_num
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_value_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let run_file = dir.path().join("run_num.txt");
        fs::write(&run_file, "41\n").unwrap();

        let run = update_run_number(&run_file, dir.path()).unwrap();
        assert_eq!(run, "42");
        assert_eq!(fs::read_to_string(&run_file).unwrap(), "42");
    }

    #[test]
    fn recovers_from_raw_directory_when_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let run_file = dir.path().join("run_num.txt");
        fs::write(&run_file, "not a number").unwrap();

        fs::write(dir.path().join("rawHits_RN-3_FN-0.txt"), "").unwrap();
        fs::write(dir.path().join("rawHits_RN-17_FN-4.txt"), "").unwrap();
        fs::write(dir.path().join("rawHits_RN-9_FN-1.txt"), "").unwrap();
        // near misses that must not count
        fs::write(dir.path().join("speciesHits_RN-99_FN-0.txt"), "").unwrap();
        fs::write(dir.path().join("rawHits_RN-50_FN-.txt"), "").unwrap();

        let run = update_run_number(&run_file, dir.path()).unwrap();
        assert_eq!(run, "18");
    }

    #[test]
    fn defaults_to_one_with_no_file_and_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let run_file = dir.path().join("run_num.txt");

        let run = update_run_number(&run_file, dir.path()).unwrap();
        assert_eq!(run, "1");
        assert_eq!(fs::read_to_string(&run_file).unwrap(), "1");
    }
}
