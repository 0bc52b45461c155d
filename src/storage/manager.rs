//! manager.rs
//! Two writer workers: one drains the raw-write buffer, one drains the
//! species queue. Both write into sequentially numbered text files that
//! start with the run header and rotate once a soft line cap is passed.
//! A file-open failure is fatal for that worker only.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::acquisition::config::AcqConfig;
use crate::acquisition::device::PixelHit;
use crate::buffers::{HitBuffer, SpeciesQueue, StopGuard, safe_finish};
use crate::logging::{LogLevel, SharedLogger};
use crate::processing::cluster::SpeciesHit;
use crate::settings::{
    MAX_BUFF_EL, MAX_RAW_FILE_LINES, MAX_SPECIES_FILE_LINES, RAW_DATA_DIR, RAW_FILE_STEM,
    SPECIES_DATA_DIR, SPECIES_FILE_STEM,
};
use crate::storage::header::render_header;

pub const RAW_LINE_FORMAT: &str = "x y toa tot";
pub const SPECIES_LINE_FORMAT: &str = "grade start_toa end_toa total_energy";

/// Bounded wait used by the raw worker when its buffer is empty. The
/// producer notifies early once the backlog passes `RAW_HIT_NOTIF_INC`;
/// the timeout bounds drain latency for trickle traffic.
const RAW_DRAIN_WAIT: Duration = Duration::from_millis(100);

pub struct StorageManager {
    run_number: String,
    species: Arc<SpeciesQueue>,
    raw_hits_to_write: Arc<HitBuffer<PixelHit>>,
    logger: SharedLogger,
    raw_header: Option<String>,
    species_header: Option<String>,
    raw_worker: Option<JoinHandle<()>>,
    species_worker: Option<JoinHandle<()>>,
}

impl StorageManager {
    pub fn new(
        run_number: String,
        species: Arc<SpeciesQueue>,
        raw_hits_to_write: Arc<HitBuffer<PixelHit>>,
        logger: SharedLogger,
    ) -> Self {
        Self {
            run_number,
            species,
            raw_hits_to_write,
            logger,
            raw_header: None,
            species_header: None,
            raw_worker: None,
            species_worker: None,
        }
    }

    /// Renders the per-stream headers. Must run before `launch` so the
    /// first files of the run carry them.
    pub fn gen_header(&mut self, start_time: u64, config: &AcqConfig) {
        self.raw_header = Some(render_header(start_time, config, RAW_LINE_FORMAT));
        self.species_header = Some(render_header(start_time, config, SPECIES_LINE_FORMAT));
    }

    /// Spawns both writer threads. Joined by `Drop` via `safe_finish`.
    pub fn launch(&mut self) {
        let raw_writer = RotatingWriter::plan(
            PathBuf::from(RAW_DATA_DIR),
            RAW_FILE_STEM,
            self.run_number.clone(),
            self.raw_header.clone().unwrap_or_default(),
            MAX_RAW_FILE_LINES,
        );
        let species_writer = RotatingWriter::plan(
            PathBuf::from(SPECIES_DATA_DIR),
            SPECIES_FILE_STEM,
            self.run_number.clone(),
            self.species_header.clone().unwrap_or_default(),
            MAX_SPECIES_FILE_LINES,
        );

        let buff = self.raw_hits_to_write.clone();
        let logger = self.logger.clone();
        self.raw_worker = Some(thread::spawn(move || {
            logger.log(LogLevel::Info, "raw hit writer thread launched");
            if let Err(e) = run_raw_writer(&buff, raw_writer) {
                logger.log_error(LogLevel::Fatal, "raw hit writer terminated", &e);
                return;
            }
            logger.log(LogLevel::Info, "raw hit writer thread terminated");
        }));

        let queue = self.species.clone();
        let logger = self.logger.clone();
        self.species_worker = Some(thread::spawn(move || {
            logger.log(LogLevel::Info, "species hit writer thread launched");
            if let Err(e) = run_species_writer(&queue, species_writer) {
                logger.log_error(LogLevel::Fatal, "species hit writer terminated", &e);
                return;
            }
            logger.log(LogLevel::Info, "species hit writer thread terminated");
        }));
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        safe_finish(&mut self.species_worker, self.species.as_ref());
        safe_finish(&mut self.raw_worker, self.raw_hits_to_write.as_ref());
    }
}

/// Parameters of one rotating output stream, plus its open file once the
/// worker starts writing.
struct RotatingWriter {
    dir: PathBuf,
    stem: &'static str,
    run_number: String,
    header: String,
    soft_max_lines: u64,
    file_no: u64,
    line_count: u64,
    out: Option<BufWriter<File>>,
}

impl RotatingWriter {
    fn plan(
        dir: PathBuf,
        stem: &'static str,
        run_number: String,
        header: String,
        soft_max_lines: u64,
    ) -> Self {
        Self {
            dir,
            stem,
            run_number,
            header,
            soft_max_lines,
            file_no: 0,
            line_count: 0,
            out: None,
        }
    }

    /// Opens the first file, or the next one when the soft cap was
    /// passed, writing the header each time. Returns the active writer.
    fn rotate_if_needed(&mut self) -> io::Result<&mut BufWriter<File>> {
        let rotate = match self.out {
            None => true,
            Some(_) => self.line_count > self.soft_max_lines,
        };
        if rotate {
            if let Some(mut old) = self.out.take() {
                old.flush()?;
            }
            let name = format!(
                "{}_RN-{}_FN-{}.txt",
                self.stem, self.run_number, self.file_no
            );
            let mut out = BufWriter::new(File::create(self.dir.join(name))?);
            out.write_all(self.header.as_bytes())?;
            self.line_count = 0;
            self.file_no += 1;
            self.out = Some(out);
        }
        match self.out.as_mut() {
            Some(out) => Ok(out),
            None => Err(io::Error::other("output file missing after rotation")),
        }
    }

    fn add_lines(&mut self, n: usize) {
        self.line_count += n as u64;
    }

    fn finish(&mut self) -> io::Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        Ok(())
    }
}

fn run_raw_writer(
    buff: &HitBuffer<PixelHit>,
    mut writer: RotatingWriter,
) -> io::Result<()> {
    let mut work: Vec<PixelHit> = Vec::with_capacity(MAX_BUFF_EL);

    loop {
        let stopping = buff.stop_requested();
        let copied = {
            let mut store = buff.lock();
            if store.is_empty() && !stopping {
                buff.wait_for(&mut store, RAW_DRAIN_WAIT);
            }
            store.copy_clear(&mut work, MAX_BUFF_EL)
        };

        if stopping && copied == 0 {
            // fully drained; the soft cap only rotates ahead of a next
            // record, so the way out must not open a new file
            break;
        }
        if copied == 0 {
            continue;
        }

        let out = writer.rotate_if_needed()?;
        for hit in &work {
            writeln!(out, "{} {} {} {}", hit.x, hit.y, hit.toa, hit.tot)?;
        }
        writer.add_lines(copied);
    }
    writer.finish()
}

fn run_species_writer(queue: &SpeciesQueue, mut writer: RotatingWriter) -> io::Result<()> {
    loop {
        let batch: Vec<SpeciesHit> = {
            let mut items = queue.lock();
            while items.is_empty() && !queue.stop_requested() {
                queue.wait(&mut items);
            }
            items.drain(..).collect()
        };

        if batch.is_empty() {
            // the wait only returns empty once stop was requested; same
            // rule as the raw stream: no rotation without a next record
            break;
        }

        let out = writer.rotate_if_needed()?;
        for hit in &batch {
            writeln!(
                out,
                "{} {} {} {}",
                hit.grade, hit.start_toa, hit.end_toa, hit.total_energy
            )?;
        }
        writer.add_lines(batch.len());
    }
    writer.finish()
}
