//! Live packet source: one capture handle per interface feeding one queue.
//!
//! Each interface gets its own blocking capture thread. The thread copies
//! every frame out of the shared kernel buffer into an owned buffer, decodes
//! it, and pushes the result onto the shared queue; the packet-processing
//! timer drains the queue on its own cadence. Capture threads never touch the
//! async runtime.

pub mod decode;
pub mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use eyre::Context;
use pcap::{Active, Capture, Device};

use crate::config::EngineConfig;
use decode::PacketMetadata;

/// Shared handoff between capture threads (producers) and the packet
/// processing timer (the single consumer).
pub type PacketQueue = Arc<Mutex<Vec<PacketMetadata>>>;

pub struct PacketSource {
    queue: PacketQueue,
    stop_flag: Arc<AtomicBool>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl Default for PacketSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSource {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            stop_flag: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    /// Open a capture handle per requested interface (every capturable device
    /// when `interfaces` is empty) and start the capture threads.
    ///
    /// A device that fails to open is logged and skipped; the rest keep
    /// capturing. Returns how many handles opened — zero is not an error, the
    /// caller's sink simply sees no traffic.
    pub fn start(&mut self, interfaces: &[String], config: &EngineConfig) -> eyre::Result<usize> {
        let devices = Device::list().context("Could not list capture devices")?;

        let selected: Vec<Device> = if interfaces.is_empty() {
            devices
        } else {
            devices
                .into_iter()
                .filter(|d| interfaces.iter().any(|name| *name == d.name))
                .collect()
        };

        let mut opened = 0usize;
        for device in selected {
            let name = device.name.clone();
            match open_capture(device, config) {
                Ok(capture) => {
                    let queue = Arc::clone(&self.queue);
                    let stop_flag = Arc::clone(&self.stop_flag);
                    let thread_name = format!("capture-{name}");
                    let worker = std::thread::Builder::new()
                        .name(thread_name)
                        .spawn(move || run_capture(&name, capture, &queue, &stop_flag))
                        .context("Could not spawn capture thread")?;
                    self.workers.push(worker);
                    opened += 1;
                }
                Err(e) => {
                    tracing::warn!(interface = %name, "Could not open capture handle: {e}");
                }
            }
        }

        if opened == 0 {
            tracing::warn!("No capture handles opened; the packet stream will be empty");
        }

        Ok(opened)
    }

    /// Atomically drain and return everything queued since the last flush.
    pub fn flush_queue(&self) -> Vec<PacketMetadata> {
        Self::drain_handle(&self.queue)
    }

    /// A clonable handle onto the queue for consumers that outlive the
    /// borrow of the source itself.
    pub fn queue_handle(&self) -> PacketQueue {
        Arc::clone(&self.queue)
    }

    /// Drain a queue handle obtained from [`PacketSource::queue_handle`].
    pub fn drain_handle(queue: &PacketQueue) -> Vec<PacketMetadata> {
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *queue)
    }

    /// Close every capture handle. Failures joining one worker are logged and
    /// do not prevent stopping the rest. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("capture").to_string();
            if worker.join().is_err() {
                tracing::warn!(thread = %name, "Capture thread panicked during shutdown");
            }
        }
    }
}

fn open_capture(device: Device, config: &EngineConfig) -> eyre::Result<Capture<Active>> {
    Capture::from_device(device)
        .context("Could not load capture device")?
        .promisc(true)
        .snaplen(config.capture_snaplen)
        .buffer_size(config.capture_buffer_bytes)
        .immediate_mode(true)
        .timeout(100)
        .open()
        .context("Could not open capture device")
}

fn run_capture(
    interface: &str,
    mut capture: Capture<Active>,
    queue: &Mutex<Vec<PacketMetadata>>,
    stop_flag: &AtomicBool,
) {
    loop {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }

        match capture.next_packet() {
            Ok(frame) => {
                let timestamp_ms = frame.header.ts.tv_sec as i64 * 1000
                    + i64::from(frame.header.ts.tv_usec as i32) / 1000;
                // Copy out of the shared kernel buffer before the next read
                // can overwrite it.
                let owned = frame.data.to_vec();

                match decode::decode_frame(interface, timestamp_ms, &owned) {
                    Ok(packet) => {
                        queue
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(packet);
                    }
                    Err(e) => {
                        tracing::debug!(interface = %interface, "Dropping undecodable frame: {e}");
                    }
                }
            }
            // Read timeout: loop back around and re-check the stop flag.
            Err(pcap::Error::TimeoutExpired) => {}
            Err(e) => {
                tracing::warn!(interface = %interface, "Capture read failed, closing handle: {e}");
                break;
            }
        }
    }
}

/// Enumerate capturable devices for the CLI listing.
pub fn list_devices() -> eyre::Result<Vec<(String, Vec<String>)>> {
    Ok(Device::list()
        .context("Could not list capture devices")?
        .into_iter()
        .map(|device| {
            let addrs = device
                .addresses
                .iter()
                .map(|a| a.addr.to_string())
                .collect();
            (device.name, addrs)
        })
        .collect())
}
