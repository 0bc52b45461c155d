//! config.rs
//! Acquisition configuration: bias and timing settings, trigger setup,
//! the 18 named DACs and the per-pixel mask words uploaded to the chip.
//! Values are fixed per run; the header writer prints them verbatim.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::settings::CHIP_AREA;

/// Bytes expected in the binary pixel-mask file.
pub const PIXEL_CONFIG_BYTES: usize = CHIP_AREA;
/// 32-bit words in the unpacked pixel configuration.
pub const PIXEL_CONFIG_WORDS: usize = PIXEL_CONFIG_BYTES / 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read pixel mask {path}: {source}")]
    MaskRead {
        path: String,
        source: std::io::Error,
    },
    #[error("pixel mask {path} has {actual} bytes (expected {expected})")]
    MaskSize {
        path: String,
        expected: usize,
        actual: usize,
    },
}

/// Readout clock phase.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    P1,
    P2,
    P4,
    P8,
    P16,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::P1 => "p1",
            Phase::P2 => "p2",
            Phase::P4 => "p4",
            Phase::P8 => "p8",
            Phase::P16 => "p16",
        }
    }
}

/// Readout clock frequency.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freq {
    F40,
    F80,
    F160,
}

impl Freq {
    pub fn name(self) -> &'static str {
        match self {
            Freq::F40 => "40 MHz",
            Freq::F80 => "80 MHz",
            Freq::F160 => "160 MHz",
        }
    }
}

/// External trigger routing. Disabled on both edges for data-driven runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub enabled: bool,
    pub channel: u8,
    pub use_falling_edge: bool,
}

pub const NO_TRIGGER: Trigger = Trigger {
    enabled: false,
    channel: 0,
    use_falling_edge: false,
};

impl Trigger {
    pub fn name(self) -> String {
        if !self.enabled {
            return "none".to_string();
        }
        format!(
            "channel {} ({} edge)",
            self.channel,
            if self.use_falling_edge { "falling" } else { "rising" }
        )
    }
}

/// The 18 named chip DACs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dacs {
    pub ibias_preamp_on: u16,
    pub ibias_preamp_off: u16,
    pub vpreamp_ncas: u16,
    pub ibias_ikrum: u16,
    pub vfbk: u16,
    pub vthreshold_fine: u16,
    pub vthreshold_coarse: u16,
    pub ibias_discs1_on: u16,
    pub ibias_discs1_off: u16,
    pub ibias_discs2_on: u16,
    pub ibias_discs2_off: u16,
    pub ibias_pixeldac: u16,
    pub ibias_tpbuffer_in: u16,
    pub ibias_tpbuffer_out: u16,
    pub vtp_coarse: u16,
    pub vtp_fine: u16,
    pub ibias_cp_pll: u16,
    pub pll_vcntrl: u16,
}

impl Dacs {
    /// Tuning used for every run on this sensor.
    pub fn hardpix_defaults() -> Self {
        Self {
            ibias_preamp_on: 32,
            ibias_preamp_off: 8,
            vpreamp_ncas: 128,
            ibias_ikrum: 15,
            vfbk: 164,
            vthreshold_fine: 378,
            vthreshold_coarse: 7,
            ibias_discs1_on: 32,
            ibias_discs1_off: 8,
            ibias_discs2_on: 32,
            ibias_discs2_off: 8,
            ibias_pixeldac: 60,
            ibias_tpbuffer_in: 128,
            ibias_tpbuffer_out: 128,
            vtp_coarse: 0,
            vtp_fine: 0,
            ibias_cp_pll: 128,
            pll_vcntrl: 128,
        }
    }

    /// The DACs with their device names, in upload order.
    pub fn named(&self) -> [(&'static str, u16); 18] {
        [
            ("Ibias_Preamp_ON", self.ibias_preamp_on),
            ("Ibias_Preamp_OFF", self.ibias_preamp_off),
            ("VPReamp_NCAS", self.vpreamp_ncas),
            ("Ibias_Ikrum", self.ibias_ikrum),
            ("Vfbk", self.vfbk),
            ("Vthreshold_fine", self.vthreshold_fine),
            ("Vthreshold_coarse", self.vthreshold_coarse),
            ("Ibias_DiscS1_ON", self.ibias_discs1_on),
            ("Ibias_DiscS1_OFF", self.ibias_discs1_off),
            ("Ibias_DiscS2_ON", self.ibias_discs2_on),
            ("Ibias_DiscS2_OFF", self.ibias_discs2_off),
            ("Ibias_PixelDAC", self.ibias_pixeldac),
            ("Ibias_TPbufferIn", self.ibias_tpbuffer_in),
            ("Ibias_TPbufferOut", self.ibias_tpbuffer_out),
            ("VTP_coarse", self.vtp_coarse),
            ("VTP_fine", self.vtp_fine),
            ("Ibias_CP_PLL", self.ibias_cp_pll),
            ("PLL_Vcntrl", self.pll_vcntrl),
        ]
    }
}

/// Per-pixel mask/threshold words from the `.bmc` file.
#[derive(Debug, Clone)]
pub struct PixelConfig {
    words: Vec<u32>,
}

impl PixelConfig {
    pub fn load_bmc(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::MaskRead {
            path: path.display().to_string(),
            source,
        })?;
        if bytes.len() != PIXEL_CONFIG_BYTES {
            return Err(ConfigError::MaskSize {
                path: path.display().to_string(),
                expected: PIXEL_CONFIG_BYTES,
                actual: bytes.len(),
            });
        }

        let words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { words })
    }

    pub fn word(&self, index: usize) -> u32 {
        self.words[index]
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

#[derive(Debug, Clone)]
pub struct AcqConfig {
    pub bias_id: u8,
    pub acq_time: Duration,
    pub no_frames: u32,
    pub bias: f32,
    pub delayed_start: bool,
    pub start_trigger: Trigger,
    pub stop_trigger: Trigger,
    pub gray_disable: bool,
    pub polarity_holes: bool,
    pub phase: Phase,
    pub freq: Freq,
    pub dacs: Dacs,
    pub pixel_config: PixelConfig,
}

impl AcqConfig {
    /// The fixed tuning for this sensor, with the run-specific
    /// acquisition time and the pixel mask loaded from disk.
    pub fn hardpix_defaults(acq_time_secs: u64, pixel_config: PixelConfig) -> Self {
        Self {
            bias_id: 0,
            acq_time: Duration::from_secs(acq_time_secs),
            no_frames: 1,
            bias: 0.0,
            delayed_start: false,
            start_trigger: NO_TRIGGER,
            stop_trigger: NO_TRIGGER,
            gray_disable: false,
            polarity_holes: true,
            phase: Phase::P1,
            freq: Freq::F40,
            dacs: Dacs::hardpix_defaults(),
            pixel_config,
        }
    }
}
