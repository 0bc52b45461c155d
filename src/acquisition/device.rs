//! device.rs
//! UDP session with the readout board. This is the driver boundary: a
//! control socket for commands (chip identification, configuration
//! upload, acquisition start) and a data socket whose datagrams a reader
//! thread decodes into frame/pixel events. The blocking acquisition loop
//! consumes those events through a bounded channel; its receive timeout
//! is the hit timeout.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::acquisition::config::{AcqConfig, Freq, Phase};

const CONTROL_PORT: u16 = 1555;
const DATA_PORT: u16 = 1556;

/// Reply wait on the control socket.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);
/// Data-socket poll interval; bounds how long the reader thread takes to
/// observe shutdown.
const DATA_POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// Kernel receive buffer on the data socket; pixel bursts arrive faster
/// than the acquisition loop is scheduled.
const DATA_RECV_BUFFER_BYTES: usize = 8 * 1024 * 1024;
/// Decoded events in flight between the reader thread and the
/// acquisition loop.
const EVENT_CHANNEL_DEPTH: usize = 256;

const CMD_GET_CHIP_ID: u8 = 0x31;
const CMD_ACQ_SETUP: u8 = 0x40;
const CMD_ACQ_START: u8 = 0x41;
const CMD_PX_CONFIG_CHUNK: u8 = 0x42;
const CMD_PX_CONFIG_COMMIT: u8 = 0x43;

const TAG_FRAME_STARTED: u8 = 0x01;
const TAG_FRAME_ENDED: u8 = 0x02;
const TAG_PIXELS: u8 = 0x03;

/// Bytes per encoded pixel record: x, y, ftoa, pad, tot (LE u16),
/// toa (LE u64).
const PIXEL_RECORD_BYTES: usize = 14;
/// Pixel-mask bytes per upload chunk.
const PX_CONFIG_CHUNK_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("socket failure: {0}")]
    Socket(#[from] std::io::Error),
    #[error("no reply to command 0x{opcode:02x}")]
    ControlTimeout { opcode: u8 },
    #[error("command 0x{opcode:02x} rejected with status {status}")]
    CommandRejected { opcode: u8, status: u8 },
    #[error("malformed reply to {query}")]
    BadReply { query: &'static str },
    #[error("not a valid readout address: {0}")]
    BadAddress(String),
    #[error("bad chip ID (expected: {expected}, actual: {actual})")]
    ChipIdMismatch { expected: String, actual: String },
    #[error("no data from readout for {0} ms")]
    HitTimeout(u64),
    #[error("data stream ended unexpectedly")]
    StreamClosed,
    #[error("device not connected")]
    NotConnected,
    #[error("device not configured")]
    NotConfigured,
}

/// One raw photon event as reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelHit {
    pub x: u8,
    pub y: u8,
    pub toa: u64,
    pub ftoa: u8,
    pub tot: u16,
}

/// Per-frame statistics delivered with the frame-ended report.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameInfo {
    pub lost_pixels: u64,
    pub sent_pixels: u64,
    pub received_pixels: u64,
    pub start_time: u64,
    pub end_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadoutType {
    #[allow(dead_code)]
    FrameBased,
    DataDriven,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqState {
    Created,
    Running,
    Ended,
    TimedOut,
}

impl AcqState {
    pub fn name(self) -> &'static str {
        match self {
            AcqState::Created => "created",
            AcqState::Running => "running",
            AcqState::Ended => "ended",
            AcqState::TimedOut => "timed out",
        }
    }
}

enum DeviceEvent {
    FrameStarted(i32),
    FrameEnded {
        frame_idx: i32,
        completed: bool,
        info: FrameInfo,
    },
    Pixels(Vec<PixelHit>),
}

/// An open session with the readout board.
pub struct Device {
    ctrl: UdpSocket,
    data: Arc<UdpSocket>,
}

impl Device {
    /// Creates and connects both sockets. Fails fast; retry policy is
    /// the caller's.
    pub fn connect(address: &str) -> Result<Self, DeviceError> {
        let host: Ipv4Addr = address
            .parse()
            .map_err(|_| DeviceError::BadAddress(address.to_string()))?;

        let ctrl = open_udp(SocketAddr::from((host, CONTROL_PORT)), None)?;
        ctrl.set_read_timeout(Some(CONTROL_TIMEOUT))?;

        let data = open_udp(
            SocketAddr::from((host, DATA_PORT)),
            Some(DATA_RECV_BUFFER_BYTES),
        )?;
        data.set_read_timeout(Some(DATA_POLL_TIMEOUT))?;

        Ok(Self {
            ctrl,
            data: Arc::new(data),
        })
    }

    /// Queries the sensor's chip identifier.
    pub fn chip_id(&self) -> Result<String, DeviceError> {
        let reply = self.request(&[CMD_GET_CHIP_ID, 0, 0, 0, 0, 0, 0, 0])?;
        if reply.len() < 2 || reply[0] != CMD_GET_CHIP_ID {
            return Err(DeviceError::BadReply { query: "chip id" });
        }
        let len = reply[1] as usize;
        if reply.len() < 2 + len {
            return Err(DeviceError::BadReply { query: "chip id" });
        }
        String::from_utf8(reply[2..2 + len].to_vec())
            .map_err(|_| DeviceError::BadReply { query: "chip id" })
    }

    /// Uploads the acquisition settings and pixel mask, then starts the
    /// readout.
    fn begin(&self, config: &AcqConfig, readout: ReadoutType) -> Result<(), DeviceError> {
        self.command(&encode_setup(config))?;

        for (chunk_idx, chunk) in px_config_bytes(config).chunks(PX_CONFIG_CHUNK_BYTES).enumerate() {
            let mut frame = Vec::with_capacity(3 + chunk.len());
            frame.push(CMD_PX_CONFIG_CHUNK);
            frame.extend_from_slice(&(chunk_idx as u16).to_le_bytes());
            frame.extend_from_slice(chunk);
            self.ctrl.send(&frame)?;
        }
        self.command(&[CMD_PX_CONFIG_COMMIT, 0, 0, 0, 0, 0, 0, 0])?;

        let readout_byte = match readout {
            ReadoutType::FrameBased => 0u8,
            ReadoutType::DataDriven => 1u8,
        };
        self.command(&[CMD_ACQ_START, readout_byte, 0, 0, 0, 0, 0, 0])
    }

    /// Sends a command and checks the `[opcode, status]` ack.
    fn command(&self, frame: &[u8]) -> Result<(), DeviceError> {
        let opcode = frame[0];
        let reply = self.request(frame)?;
        if reply.len() < 2 || reply[0] != opcode {
            return Err(DeviceError::BadReply { query: "ack" });
        }
        if reply[1] != 0 {
            return Err(DeviceError::CommandRejected {
                opcode,
                status: reply[1],
            });
        }
        Ok(())
    }

    fn request(&self, frame: &[u8]) -> Result<Vec<u8>, DeviceError> {
        self.ctrl.send(frame)?;
        let mut buf = [0u8; 512];
        match self.ctrl.recv(&mut buf) {
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(DeviceError::ControlTimeout { opcode: frame[0] })
            }
            Err(e) => Err(DeviceError::Socket(e)),
        }
    }
}

fn open_udp(peer: SocketAddr, recv_buffer: Option<usize>) -> Result<UdpSocket, DeviceError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(bytes) = recv_buffer {
        socket.set_recv_buffer_size(bytes)?;
    }
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.connect(&peer.into())?;
    Ok(socket.into())
}

fn encode_setup(config: &AcqConfig) -> Vec<u8> {
    let mut frame = Vec::with_capacity(64);
    frame.push(CMD_ACQ_SETUP);
    frame.push(config.bias_id);
    frame.extend_from_slice(&(config.acq_time.as_nanos() as u64).to_le_bytes());
    frame.extend_from_slice(&config.no_frames.to_le_bytes());
    frame.extend_from_slice(&config.bias.to_le_bytes());
    frame.push(u8::from(config.delayed_start));
    frame.push(u8::from(config.start_trigger.enabled));
    frame.push(config.start_trigger.channel);
    frame.push(u8::from(config.start_trigger.use_falling_edge));
    frame.push(u8::from(config.stop_trigger.enabled));
    frame.push(config.stop_trigger.channel);
    frame.push(u8::from(config.stop_trigger.use_falling_edge));
    frame.push(u8::from(config.gray_disable));
    frame.push(u8::from(config.polarity_holes));
    frame.push(match config.phase {
        Phase::P1 => 1,
        Phase::P2 => 2,
        Phase::P4 => 4,
        Phase::P8 => 8,
        Phase::P16 => 16,
    });
    frame.push(match config.freq {
        Freq::F40 => 40,
        Freq::F80 => 80,
        Freq::F160 => 160,
    });
    for (_, value) in config.dacs.named() {
        frame.extend_from_slice(&value.to_le_bytes());
    }
    frame
}

fn px_config_bytes(config: &AcqConfig) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(config.pixel_config.words().len() * 4);
    for word in config.pixel_config.words() {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// One blocking readout session. Handlers are installed before
/// [`Acquisition::run`] and are invoked on the calling thread.
pub struct Acquisition<'h> {
    hit_timeout: Duration,
    frame_started: Option<Box<dyn FnMut(i32) + 'h>>,
    frame_ended: Option<Box<dyn FnMut(i32, bool, &FrameInfo) + 'h>>,
    pixels_received: Option<Box<dyn FnMut(&[PixelHit]) + 'h>>,
    state: AcqState,
    completed_frames: u32,
    dropped_data: Arc<AtomicU64>,
}

impl<'h> Acquisition<'h> {
    pub fn new(hit_timeout: Duration) -> Self {
        Self {
            hit_timeout,
            frame_started: None,
            frame_ended: None,
            pixels_received: None,
            state: AcqState::Created,
            completed_frames: 0,
            dropped_data: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_frame_started_handler(&mut self, handler: impl FnMut(i32) + 'h) {
        self.frame_started = Some(Box::new(handler));
    }

    pub fn set_frame_ended_handler(&mut self, handler: impl FnMut(i32, bool, &FrameInfo) + 'h) {
        self.frame_ended = Some(Box::new(handler));
    }

    pub fn set_pixels_received_handler(&mut self, handler: impl FnMut(&[PixelHit]) + 'h) {
        self.pixels_received = Some(Box::new(handler));
    }

    pub fn state(&self) -> AcqState {
        self.state
    }

    pub fn completed_frames(&self) -> u32 {
        self.completed_frames
    }

    /// Datagrams the reader failed to decode.
    pub fn dropped_measurement_data(&self) -> u64 {
        self.dropped_data.load(Ordering::Relaxed)
    }

    /// Starts the readout and blocks until every configured frame has
    /// ended, the hit timeout expires, or the transport fails.
    pub fn run(
        &mut self,
        device: &Device,
        config: &AcqConfig,
        readout: ReadoutType,
    ) -> Result<(), DeviceError> {
        device.begin(config, readout)?;
        self.state = AcqState::Running;

        let (event_tx, event_rx) = channel::bounded::<DeviceEvent>(EVENT_CHANNEL_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(
            device.data.clone(),
            event_tx,
            shutdown.clone(),
            self.dropped_data.clone(),
        );

        let result = self.dispatch_events(&event_rx, config.no_frames);

        shutdown.store(true, Ordering::Release);
        let _ = reader.join();
        result
    }

    fn dispatch_events(
        &mut self,
        events: &channel::Receiver<DeviceEvent>,
        no_frames: u32,
    ) -> Result<(), DeviceError> {
        loop {
            match events.recv_timeout(self.hit_timeout) {
                Ok(DeviceEvent::FrameStarted(idx)) => {
                    if let Some(handler) = self.frame_started.as_mut() {
                        handler(idx);
                    }
                }
                Ok(DeviceEvent::Pixels(batch)) => {
                    if let Some(handler) = self.pixels_received.as_mut() {
                        handler(&batch);
                    }
                }
                Ok(DeviceEvent::FrameEnded {
                    frame_idx,
                    completed,
                    info,
                }) => {
                    if completed {
                        self.completed_frames += 1;
                    }
                    if let Some(handler) = self.frame_ended.as_mut() {
                        handler(frame_idx, completed, &info);
                    }
                    if frame_idx as u32 + 1 >= no_frames {
                        self.state = AcqState::Ended;
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.state = AcqState::TimedOut;
                    return Err(DeviceError::HitTimeout(self.hit_timeout.as_millis() as u64));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // reader thread died on a socket error
                    self.state = AcqState::TimedOut;
                    return Err(DeviceError::StreamClosed);
                }
            }
        }
    }
}

fn spawn_reader(
    data: Arc<UdpSocket>,
    events: Sender<DeviceEvent>,
    shutdown: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 65_535];
        while !shutdown.load(Ordering::Acquire) {
            let n = match data.recv(&mut buf) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    debug!("data socket receive failed: {}", e);
                    return; // drops the sender; the dispatcher sees Disconnected
                }
            };

            match decode_datagram(&buf[..n]) {
                Some(event) => {
                    if events.send(event).is_err() {
                        return;
                    }
                }
                None => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    })
}

fn decode_datagram(payload: &[u8]) -> Option<DeviceEvent> {
    match payload.first()? {
        &TAG_FRAME_STARTED if payload.len() == 5 => {
            Some(DeviceEvent::FrameStarted(read_i32(&payload[1..5])))
        }
        &TAG_FRAME_ENDED if payload.len() == 46 => Some(DeviceEvent::FrameEnded {
            frame_idx: read_i32(&payload[1..5]),
            completed: payload[5] != 0,
            info: FrameInfo {
                lost_pixels: read_u64(&payload[6..14]),
                sent_pixels: read_u64(&payload[14..22]),
                received_pixels: read_u64(&payload[22..30]),
                start_time: read_u64(&payload[30..38]),
                end_time: read_u64(&payload[38..46]),
            },
        }),
        &TAG_PIXELS if payload.len() >= 3 => {
            let count = u16::from_le_bytes([payload[1], payload[2]]) as usize;
            let body = &payload[3..];
            if body.len() != count * PIXEL_RECORD_BYTES {
                return None;
            }
            let hits = body
                .chunks_exact(PIXEL_RECORD_BYTES)
                .map(decode_pixel)
                .collect();
            Some(DeviceEvent::Pixels(hits))
        }
        _ => None,
    }
}

fn decode_pixel(record: &[u8]) -> PixelHit {
    PixelHit {
        x: record[0],
        y: record[1],
        ftoa: record[2],
        tot: u16::from_le_bytes([record[4], record[5]]),
        toa: read_u64(&record[6..14]),
    }
}

fn read_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_pixel(hit: &PixelHit) -> [u8; PIXEL_RECORD_BYTES] {
        let mut record = [0u8; PIXEL_RECORD_BYTES];
        record[0] = hit.x;
        record[1] = hit.y;
        record[2] = hit.ftoa;
        record[4..6].copy_from_slice(&hit.tot.to_le_bytes());
        record[6..14].copy_from_slice(&hit.toa.to_le_bytes());
        record
    }

    #[test]
    fn pixel_datagram_round_trips() {
        let hits = [
            PixelHit {
                x: 12,
                y: 200,
                toa: 123_456_789_012,
                ftoa: 9,
                tot: 1023,
            },
            PixelHit {
                x: 0,
                y: 255,
                toa: 1,
                ftoa: 0,
                tot: 0,
            },
        ];

        let mut payload = vec![TAG_PIXELS];
        payload.extend_from_slice(&(hits.len() as u16).to_le_bytes());
        for hit in &hits {
            payload.extend_from_slice(&encode_pixel(hit));
        }

        match decode_datagram(&payload) {
            Some(DeviceEvent::Pixels(decoded)) => assert_eq!(decoded, hits),
            _ => panic!("expected pixel event"),
        }
    }

    #[test]
    fn truncated_pixel_datagram_is_dropped() {
        let mut payload = vec![TAG_PIXELS];
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&[0u8; PIXEL_RECORD_BYTES]); // one record short
        assert!(decode_datagram(&payload).is_none());
    }

    #[test]
    fn frame_ended_datagram_decodes_counters() {
        let mut payload = vec![TAG_FRAME_ENDED];
        payload.extend_from_slice(&3i32.to_le_bytes());
        payload.push(1);
        payload.extend_from_slice(&7u64.to_le_bytes());
        payload.extend_from_slice(&1000u64.to_le_bytes());
        payload.extend_from_slice(&993u64.to_le_bytes());
        payload.extend_from_slice(&111u64.to_le_bytes());
        payload.extend_from_slice(&222u64.to_le_bytes());

        match decode_datagram(&payload) {
            Some(DeviceEvent::FrameEnded {
                frame_idx,
                completed,
                info,
            }) => {
                assert_eq!(frame_idx, 3);
                assert!(completed);
                assert_eq!(info.lost_pixels, 7);
                assert_eq!(info.sent_pixels, 1000);
                assert_eq!(info.received_pixels, 993);
                assert_eq!(info.start_time, 111);
                assert_eq!(info.end_time, 222);
            }
            _ => panic!("expected frame-ended event"),
        }
    }

    #[test]
    fn unknown_tag_is_dropped() {
        assert!(decode_datagram(&[0x7f, 1, 2, 3]).is_none());
        assert!(decode_datagram(&[]).is_none());
    }
}
