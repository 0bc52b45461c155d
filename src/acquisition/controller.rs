//! controller.rs
//! Owns the device session and feeds received pixels into the two
//! downstream buffers. Connection is retried with a fixed pause and
//! verified against the expected chip ID; callbacks run on the driver's
//! reader side and must not block beyond the buffer locks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::acquisition::config::{AcqConfig, ConfigError, PixelConfig};
use crate::acquisition::device::{Acquisition, Device, DeviceError, FrameInfo, PixelHit, ReadoutType};
use crate::buffers::HitBuffer;
use crate::logging::{LogLevel, SharedLogger};
use crate::settings::{
    CHIP_ID, CNXT_ATTEMPTS, HIT_TIMEOUT_MS, HP_ADDRESS, PATH_TO_CHIP_CONFIG, RAW_HIT_NOTIF_INC,
    SEC_BTW_CNXT_ATTEMPTS,
};

pub struct AcqController {
    raw_hits: Arc<HitBuffer<PixelHit>>,
    raw_hits_to_write: Arc<HitBuffer<PixelHit>>,
    logger: SharedLogger,
    device: Option<Device>,
    config: Option<AcqConfig>,
    n_hits: AtomicU64,
}

impl AcqController {
    pub fn new(
        raw_hits: Arc<HitBuffer<PixelHit>>,
        raw_hits_to_write: Arc<HitBuffer<PixelHit>>,
        logger: SharedLogger,
    ) -> Self {
        Self {
            raw_hits,
            raw_hits_to_write,
            logger,
            device: None,
            config: None,
            n_hits: AtomicU64::new(0),
        }
    }

    /// Establishes the device session: socket creation, then chip-id
    /// verification, each retried `CNXT_ATTEMPTS` times with
    /// `SEC_BTW_CNXT_ATTEMPTS` pauses. Returns the last error once both
    /// ladders are exhausted.
    pub fn connect(&mut self) -> Result<(), DeviceError> {
        let mut last_err = DeviceError::NotConnected;

        self.device = None;
        for _ in 0..CNXT_ATTEMPTS {
            match Device::connect(HP_ADDRESS) {
                Ok(device) => {
                    self.device = Some(device);
                    break;
                }
                Err(e) => {
                    self.logger
                        .log_error(LogLevel::Error, "failed to create sockets", &e);
                    last_err = e;
                    thread::sleep(Duration::from_secs(SEC_BTW_CNXT_ATTEMPTS));
                }
            }
        }
        if self.device.is_none() {
            self.logger.log(LogLevel::Fatal, "abandoned socket creation");
            return Err(last_err);
        }

        for _ in 0..CNXT_ATTEMPTS {
            match self.test_connection() {
                Ok(()) => {
                    self.logger.log(LogLevel::Info, "device connection successful");
                    return Ok(());
                }
                Err(e) => {
                    self.logger
                        .log_error(LogLevel::Error, "connection test failed", &e);
                    last_err = e;
                }
            }
            thread::sleep(Duration::from_secs(SEC_BTW_CNXT_ATTEMPTS));
        }

        self.logger.log(LogLevel::Fatal, "abandoned device connection");
        Err(last_err)
    }

    /// Fetches the chip identifier and compares it with the configured
    /// expectation.
    fn test_connection(&self) -> Result<(), DeviceError> {
        let device = self.device.as_ref().ok_or(DeviceError::NotConnected)?;
        let id = device.chip_id()?;
        if id == CHIP_ID {
            self.logger.log(
                LogLevel::Info,
                &format!("verified connection with chip id {}", id),
            );
            Ok(())
        } else {
            Err(DeviceError::ChipIdMismatch {
                expected: CHIP_ID.to_string(),
                actual: id,
            })
        }
    }

    /// Builds the run configuration: fixed device tuning plus the binary
    /// pixel mask from disk.
    pub fn load_config(&mut self, acq_time_secs: u64) -> Result<(), ConfigError> {
        let pixel_config = match PixelConfig::load_bmc(std::path::Path::new(PATH_TO_CHIP_CONFIG)) {
            Ok(px) => px,
            Err(e) => {
                self.logger
                    .log_error(LogLevel::Fatal, "pixel configuration failed", &e);
                return Err(e);
            }
        };
        self.config = Some(AcqConfig::hardpix_defaults(acq_time_secs, pixel_config));
        Ok(())
    }

    pub fn config(&self) -> Option<&AcqConfig> {
        self.config.as_ref()
    }

    /// Runs one data-driven readout session, blocking until the device
    /// reports frame end or the hit timeout expires. Callbacks dispatch
    /// from the session loop while it runs.
    pub fn run_acquisition(&self) -> Result<(), DeviceError> {
        let device = self.device.as_ref().ok_or(DeviceError::NotConnected)?;
        let config = self.config.as_ref().ok_or(DeviceError::NotConfigured)?;

        let mut acq = Acquisition::new(Duration::from_millis(HIT_TIMEOUT_MS));
        acq.set_frame_started_handler(|frame_idx| self.frame_started(frame_idx));
        acq.set_frame_ended_handler(|frame_idx, completed, info| {
            self.frame_ended(frame_idx, completed, info)
        });
        acq.set_pixels_received_handler(|px| self.pixels_received(px));

        let tic = Instant::now();
        let outcome = acq.run(device, config, ReadoutType::DataDriven);
        let duration = tic.elapsed().as_secs_f64();
        outcome?;

        let n_hits = self.n_hits.load(Ordering::Relaxed);
        self.logger.log(
            LogLevel::Info,
            &format!(
                "Acquisition completed: [state: {}] [received {} complete frames] \
[dropped {} measurement data items] [total hits: {}] [total duration: {} s] \
[throughput: {} hits/s]",
                acq.state().name(),
                acq.completed_frames(),
                acq.dropped_measurement_data(),
                n_hits,
                duration,
                n_hits as f64 / duration
            ),
        );
        Ok(())
    }

    fn frame_started(&self, _frame_idx: i32) {
        self.n_hits.store(0, Ordering::Relaxed);
        self.logger.log(LogLevel::Info, "acq frame started");
    }

    fn frame_ended(&self, frame_idx: i32, completed: bool, info: &FrameInfo) {
        let recv_perc = 100.0 * info.received_pixels as f64 / info.sent_pixels as f64;
        self.logger.log(
            LogLevel::Info,
            &format!(
                "Ended Frame #{} [tpx3->readout lost {} pixels] [readout->pc sent {} pixels] \
[readout->pc received {} pixels ({} %)] [state: {}] [start time: {}] [end time: {}]",
                frame_idx,
                info.lost_pixels,
                info.sent_pixels,
                info.received_pixels,
                recv_perc,
                if completed { "completed" } else { "not completed" },
                info.start_time,
                info.end_time
            ),
        );
    }

    /// Appends the batch to both buffers. The processor is woken on
    /// every append; the raw writer only once its backlog exceeds
    /// `RAW_HIT_NOTIF_INC`, to batch disk wakeups.
    pub(crate) fn pixels_received(&self, px: &[PixelHit]) {
        self.n_hits.fetch_add(px.len() as u64, Ordering::Relaxed);

        if log::log_enabled!(log::Level::Debug) {
            for hit in px {
                debug!(
                    "raw hit: x-{}, y-{}, toa-{}, tot-{}",
                    hit.x, hit.y, hit.toa, hit.tot
                );
            }
        }

        let discarded_raw = {
            let mut store = self.raw_hits.lock();
            store.add_elements(px).1
        };
        self.raw_hits.notify_one();
        if discarded_raw > 0 {
            self.logger.log(
                LogLevel::Warning,
                &format!(
                    "buffer overflow in pixels_received - forced to discard {} elements from raw hits buffer",
                    discarded_raw
                ),
            );
        }

        let (notify_writer, discarded_write) = {
            let mut store = self.raw_hits_to_write.lock();
            let (total, discarded) = store.add_elements(px);
            (total > RAW_HIT_NOTIF_INC, discarded)
        };
        if notify_writer {
            self.raw_hits_to_write.notify_one();
        }
        if discarded_write > 0 {
            self.logger.log(
                LogLevel::Warning,
                &format!(
                    "buffer overflow in pixels_received - forced to discard {} elements from raw write buffer",
                    discarded_write
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Logger;

    fn hit(x: u8, y: u8, toa: u64) -> PixelHit {
        PixelHit {
            x,
            y,
            toa,
            ftoa: 0,
            tot: 1,
        }
    }

    fn controller(
        dir: &tempfile::TempDir,
        capacity: usize,
    ) -> (
        AcqController,
        Arc<HitBuffer<PixelHit>>,
        Arc<HitBuffer<PixelHit>>,
    ) {
        let raw = Arc::new(HitBuffer::with_capacity(capacity));
        let write = Arc::new(HitBuffer::with_capacity(capacity));
        let logger = Arc::new(
            Logger::create(&dir.path().join("log.txt"), LogLevel::Debug).unwrap(),
        );
        (
            AcqController::new(raw.clone(), write.clone(), logger),
            raw,
            write,
        )
    }

    #[test]
    fn pixel_batch_lands_in_both_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let (ctrl, raw, write) = controller(&dir, 16);
        let batch = [hit(1, 2, 10), hit(3, 4, 11)];

        ctrl.pixels_received(&batch);

        let mut out = Vec::new();
        raw.lock().copy_clear(&mut out, 16);
        assert_eq!(out, batch);
        write.lock().copy_clear(&mut out, 16);
        assert_eq!(out, batch);
    }

    #[test]
    fn overflow_is_logged_with_exact_count() {
        let dir = tempfile::tempdir().unwrap();
        let (ctrl, _raw, _write) = controller(&dir, 4);
        let batch: Vec<PixelHit> = (0..10).map(|i| hit(i, 0, i as u64)).collect();

        ctrl.pixels_received(&batch);

        let log = std::fs::read_to_string(dir.path().join("log.txt")).unwrap();
        assert_eq!(
            log.matches("forced to discard 6 elements").count(),
            2,
            "both buffers overflowed by 6:\n{}",
            log
        );
    }
}
