//! header.rs
//! The comment block written at the top of every output file: software
//! version, readout identity, start timestamp, the full acquisition
//! configuration and the line format of the records that follow.

use std::fmt::Write;

use crate::acquisition::config::AcqConfig;
use crate::settings::{CHIP_ID, HP_ADDRESS, SOFTWARE_VERSION};

/// Pixel-config word indices sampled into the header.
const SAMPLE_WORDS_HEAD: [usize; 2] = [0, 1];
const SAMPLE_WORDS_TAIL: [usize; 2] = [16_382, 16_383];

pub fn render_header(start_time: u64, config: &AcqConfig, line_format: &str) -> String {
    let mut header = String::with_capacity(1024);
    let _ = writeln!(header, "# Software: SPRINT3 {}", SOFTWARE_VERSION);
    let _ = writeln!(header, "# Readout address: {}", HP_ADDRESS);
    let _ = writeln!(header, "# Chip ID: {}", CHIP_ID);
    let _ = writeln!(header, "# Start time: {}", start_time);
    let _ = writeln!(header, "# Acq time (s): {}", config.acq_time.as_secs());
    let _ = writeln!(header, "# Frames: {}", config.no_frames);
    let _ = writeln!(header, "# Bias ID: {}", config.bias_id);
    let _ = writeln!(header, "# Bias: {} V", config.bias);
    let _ = writeln!(header, "# Delayed start: {}", config.delayed_start);
    let _ = writeln!(header, "# Start trigger: {}", config.start_trigger.name());
    let _ = writeln!(header, "# Stop trigger: {}", config.stop_trigger.name());
    let _ = writeln!(
        header,
        "# Gray coding: {}",
        if config.gray_disable { "disabled" } else { "enabled" }
    );
    let _ = writeln!(
        header,
        "# Polarity: {}",
        if config.polarity_holes { "holes" } else { "electrons" }
    );
    let _ = writeln!(header, "# Phase: {}", config.phase.name());
    let _ = writeln!(header, "# Freq: {}", config.freq.name());
    let _ = writeln!(
        header,
        "# Pixel config: {} {} ... {} {}",
        config.pixel_config.word(SAMPLE_WORDS_HEAD[0]),
        config.pixel_config.word(SAMPLE_WORDS_HEAD[1]),
        config.pixel_config.word(SAMPLE_WORDS_TAIL[0]),
        config.pixel_config.word(SAMPLE_WORDS_TAIL[1]),
    );
    for (name, value) in config.dacs.named() {
        let _ = writeln!(header, "# DAC {}: {}", name, value);
    }
    let _ = writeln!(header, "# Format: {}", line_format);
    let _ = writeln!(header, "# {}", "-".repeat(60));
    header
}
