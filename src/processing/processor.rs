//! processor.rs
//! Worker that drains the raw-hit buffer in batches, clusters and grades
//! them, and pushes the resulting species hits downstream. One thread,
//! woken by the acquisition callback, drained fully on shutdown.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::acquisition::device::PixelHit;
use crate::buffers::{HitBuffer, SpeciesQueue, StopGuard, safe_finish};
use crate::logging::{LogLevel, SharedLogger};
use crate::processing::calibration::{CalibError, EnergyCalib};
use crate::processing::cluster::grade_clusters;
use crate::settings::MAX_BUFF_EL;

pub struct DataProcessor {
    raw_hits: Arc<HitBuffer<PixelHit>>,
    species: Arc<SpeciesQueue>,
    logger: SharedLogger,
    calib: Arc<EnergyCalib>,
    worker: Option<JoinHandle<()>>,
}

impl DataProcessor {
    pub fn new(
        raw_hits: Arc<HitBuffer<PixelHit>>,
        species: Arc<SpeciesQueue>,
        logger: SharedLogger,
    ) -> Self {
        Self {
            raw_hits,
            species,
            logger,
            calib: Arc::new(EnergyCalib::unloaded()),
            worker: None,
        }
    }

    /// Loads the a/b/c/t coefficient files and derives the per-pixel
    /// constants. Must be called before [`DataProcessor::launch`]; the
    /// table is read-only once the worker is running.
    pub fn load_energy_calib(&mut self, dir: &Path) -> Result<(), CalibError> {
        self.calib = Arc::new(EnergyCalib::load(dir)?);
        self.logger.log(
            LogLevel::Info,
            &format!("energy calibration loaded from {}", dir.display()),
        );
        Ok(())
    }

    /// Spawns the processing thread. Joined by `Drop` via `safe_finish`.
    pub fn launch(&mut self) {
        let raw_hits = self.raw_hits.clone();
        let species = self.species.clone();
        let logger = self.logger.clone();
        let calib = self.calib.clone();

        self.worker = Some(thread::spawn(move || {
            logger.log(LogLevel::Info, "data processor thread launched");
            if !calib.is_loaded() {
                logger.log(
                    LogLevel::Warning,
                    "no energy calibration loaded; species energies fall back to raw tot",
                );
            }
            processing_loop(&raw_hits, &species, &calib);
            logger.log(LogLevel::Info, "data processor thread terminated");
        }));
    }
}

impl Drop for DataProcessor {
    fn drop(&mut self) {
        safe_finish(&mut self.worker, self.raw_hits.as_ref());
    }
}

fn processing_loop(raw_hits: &HitBuffer<PixelHit>, species: &SpeciesQueue, calib: &EnergyCalib) {
    let mut work: Vec<PixelHit> = Vec::with_capacity(MAX_BUFF_EL);

    while !raw_hits.stop_requested() {
        {
            let mut store = raw_hits.lock();
            if !raw_hits.stop_requested() {
                raw_hits.wait(&mut store);
            }
            if store.is_empty() {
                // spurious wakeup, or a stop with nothing pending
                continue;
            }
            store.copy_clear(&mut work, MAX_BUFF_EL);
        }
        process_batch(&mut work, species, calib);
    }

    // drain whatever arrived after the stop request
    {
        let mut store = raw_hits.lock();
        store.copy_clear(&mut work, MAX_BUFF_EL);
    }
    process_batch(&mut work, species, calib);
}

/// Clusters one work batch and publishes the species hits under a single
/// queue lock, notifying the writer once.
fn process_batch(work: &mut Vec<PixelHit>, species: &SpeciesQueue, calib: &EnergyCalib) {
    if work.is_empty() {
        return;
    }

    let clusters = grade_clusters(work, calib);
    {
        let mut queue = species.lock();
        queue.extend(clusters);
    }
    species.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Logger;
    use std::time::Duration;

    fn test_logger(dir: &tempfile::TempDir) -> SharedLogger {
        Arc::new(Logger::create(&dir.path().join("log.txt"), LogLevel::Debug).unwrap())
    }

    fn hit(x: u8, y: u8, toa: u64, tot: u16) -> PixelHit {
        PixelHit {
            x,
            y,
            toa,
            ftoa: 0,
            tot,
        }
    }

    #[test]
    fn drains_on_notify_and_emits_species() {
        let dir = tempfile::tempdir().unwrap();
        let raw: Arc<HitBuffer<PixelHit>> = Arc::new(HitBuffer::new());
        let species = Arc::new(SpeciesQueue::new());

        let mut proc = DataProcessor::new(raw.clone(), species.clone(), test_logger(&dir));
        proc.launch();

        {
            let mut store = raw.lock();
            store.add_elements(&[hit(1, 2, 3, 10)]);
        }
        // keep notifying in case the worker had not reached its wait yet
        let mut waited = Duration::ZERO;
        loop {
            raw.notify_one();
            if species.lock().len() == 1 {
                break;
            }
            assert!(waited < Duration::from_secs(5), "species hit never arrived");
            std::thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        let front = *species.lock().front().unwrap();
        assert_eq!(front.grade, 0);
        assert_eq!(front.start_toa, 3);
    }

    #[test]
    fn residual_hits_are_processed_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let raw: Arc<HitBuffer<PixelHit>> = Arc::new(HitBuffer::new());
        let species = Arc::new(SpeciesQueue::new());

        let mut proc = DataProcessor::new(raw.clone(), species.clone(), test_logger(&dir));
        proc.launch();

        {
            let mut store = raw.lock();
            // two temporally separated clusters, never notified
            store.add_elements(&[
                hit(10, 10, 1, 50),
                hit(11, 11, 2, 10),
                hit(20, 20, 100, 30),
            ]);
        }
        drop(proc); // stop + drain + join

        let queue = species.lock();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].grade, 1);
        assert_eq!(queue[1].grade, 0);
        assert_eq!(raw.lock().len(), 0);
    }
}
