//! calibration.rs
//! Per-pixel energy calibration. Four coefficient files (a, b, c, t;
//! 65 536 whitespace-separated floats each) are folded into one
//! constants table at startup; the per-hit conversion is then a single
//! lookup plus a square root.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::acquisition::device::PixelHit;
use crate::settings::{CHIP_AREA, CHIP_WIDTH};

/// Energy above which the sensor response distorts. The correction below
/// keeps values usable up to roughly 1800 keV.
const SATURATION_KEV: f64 = 918.0;
const SATURATION_SLOPE: f64 = 0.888;

#[derive(Debug, Error)]
pub enum CalibError {
    #[error("failed to open calibration file {path}: {source}")]
    Open {
        path: PathBuf,
        source: io::Error,
    },
    #[error("bad value {token:?} in calibration file {path}")]
    Parse { path: PathBuf, token: String },
    #[error("unexpected constant count in {path} (expected {expected}, actual {actual})")]
    Count {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
}

/// Constants derived from the a, b, c, t coefficients of one pixel.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibConstants {
    pub bat: f64,
    pub ita: f64,
    pub atb: f64,
    pub fac: f64,
}

/// Calibration table indexed by `y * 256 + x`. An unloaded table makes
/// [`EnergyCalib::energy`] fall back to the raw time-over-threshold.
pub struct EnergyCalib {
    table: Vec<CalibConstants>,
}

impl EnergyCalib {
    pub fn unloaded() -> Self {
        Self { table: Vec::new() }
    }

    /// Loads `a.txt`, `b.txt`, `c.txt`, `t.txt` from `dir` and derives
    /// the per-pixel constants.
    pub fn load(dir: &Path) -> Result<Self, CalibError> {
        let a = load_constants(&dir.join("a.txt"), CHIP_AREA)?;
        let b = load_constants(&dir.join("b.txt"), CHIP_AREA)?;
        let c = load_constants(&dir.join("c.txt"), CHIP_AREA)?;
        let t = load_constants(&dir.join("t.txt"), CHIP_AREA)?;

        let mut table = Vec::with_capacity(CHIP_AREA);
        for i in 0..CHIP_AREA {
            table.push(CalibConstants {
                bat: b[i] + a[i] * t[i],
                ita: 1.0 / (2.0 * a[i]),
                atb: a[i] * t[i] - b[i],
                fac: 4.0 * a[i] * c[i],
            });
        }
        Ok(Self { table })
    }

    pub fn is_loaded(&self) -> bool {
        self.table.len() == CHIP_AREA
    }

    /// Energy of a hit in keV, or the raw `tot` if no calibration is
    /// loaded.
    pub fn energy(&self, px: &PixelHit) -> f64 {
        if !self.is_loaded() {
            return f64::from(px.tot);
        }
        let lookup = &self.table[px.y as usize * CHIP_WIDTH + px.x as usize];
        let tot = f64::from(px.tot);
        let k = lookup.bat - tot;
        let mut energy = lookup.ita * (tot + lookup.atb + (k * k + lookup.fac).sqrt());
        if energy > SATURATION_KEV {
            energy -= SATURATION_SLOPE * (energy - SATURATION_KEV);
        }
        energy
    }
}

fn load_constants(path: &Path, expected: usize) -> Result<Vec<f64>, CalibError> {
    let text = std::fs::read_to_string(path).map_err(|source| CalibError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut values = Vec::with_capacity(expected);
    for token in text.split_whitespace() {
        let value: f64 = token.parse().map_err(|_| CalibError::Parse {
            path: path.to_path_buf(),
            token: token.to_string(),
        })?;
        values.push(value);
    }

    if values.len() != expected {
        return Err(CalibError::Count {
            path: path.to_path_buf(),
            expected,
            actual: values.len(),
        });
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(x: u8, y: u8, tot: u16) -> PixelHit {
        PixelHit {
            x,
            y,
            toa: 0,
            ftoa: 0,
            tot,
        }
    }

    fn write_coeff(dir: &Path, name: &str, value: f64, count: usize) {
        let mut text = String::new();
        for i in 0..count {
            text.push_str(&format!("{}", value));
            text.push(if (i + 1) % 256 == 0 { '\n' } else { ' ' });
        }
        std::fs::write(dir.join(name), text).unwrap();
    }

    #[test]
    fn unloaded_table_returns_raw_tot() {
        let calib = EnergyCalib::unloaded();
        assert!(!calib.is_loaded());
        assert_eq!(calib.energy(&hit(12, 34, 77)), 77.0);
    }

    #[test]
    fn derives_constants_from_coefficient_files() {
        let dir = tempfile::tempdir().unwrap();
        write_coeff(dir.path(), "a.txt", 1.0, CHIP_AREA);
        write_coeff(dir.path(), "b.txt", 2.0, CHIP_AREA);
        write_coeff(dir.path(), "c.txt", 3.0, CHIP_AREA);
        write_coeff(dir.path(), "t.txt", 4.0, CHIP_AREA);

        let calib = EnergyCalib::load(dir.path()).unwrap();
        assert!(calib.is_loaded());

        // bat = b + a*t = 6, ita = 1/(2a) = 0.5, atb = a*t - b = 2,
        // fac = 4*a*c = 12
        let px = hit(0, 0, 10);
        let k = 6.0 - 10.0f64;
        let expected = 0.5 * (10.0 + 2.0 + (k * k + 12.0).sqrt());
        assert!((calib.energy(&px) - expected).abs() < 1e-12);
    }

    #[test]
    fn saturation_correction_applies_above_918() {
        let mut calib = EnergyCalib::unloaded();
        calib.table = vec![CalibConstants::default(); CHIP_AREA];
        // ita * tot with the other terms zeroed: pick ita so 2000 tot
        // lands at 1000 keV pre-correction
        calib.table[0] = CalibConstants {
            bat: 0.0,
            ita: 0.5,
            atb: 0.0,
            fac: 0.0,
        };
        let raw = 0.5 * (2000.0 + 2000.0); // ita * (tot + sqrt(k*k)) with bat=0
        assert!(raw > SATURATION_KEV);
        let expected = raw - SATURATION_SLOPE * (raw - SATURATION_KEV);
        assert!((calib.energy(&hit(0, 0, 2000)) - expected).abs() < 1e-9);
    }

    #[test]
    fn wrong_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_coeff(dir.path(), "a.txt", 1.0, 100);
        match EnergyCalib::load(dir.path()) {
            Err(CalibError::Count {
                expected, actual, ..
            }) => {
                assert_eq!(expected, CHIP_AREA);
                assert_eq!(actual, 100);
            }
            other => panic!("expected count error, got {:?}", other.err()),
        }
    }

    #[test]
    fn missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            EnergyCalib::load(dir.path()),
            Err(CalibError::Open { .. })
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "1.0 2.0 bogus").unwrap();
        assert!(matches!(
            EnergyCalib::load(dir.path()),
            Err(CalibError::Parse { .. })
        ));
    }
}
