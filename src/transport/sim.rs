//! In-process simulated camera transport
//!
//! Behaves like a GigE-Vision backend: exclusive opens, parameter
//! negotiation, a queue of registered buffers and a monotonically increasing
//! block id per stream. Frames are produced either by a timer thread or by
//! explicit `emit_frame` calls, and faults can be injected at every step.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::{DeviceDescriptor, DeviceHandle, FrameSink, StreamAck, Transport, TransportError};
use crate::capture::controls::Control;
use crate::capture::frame::{FrameMetadata, PixelFormat};
use crate::pipeline::pool::BufferLease;
use crate::StreamConfiguration;

/// Largest width or height the simulated sensor accepts
pub const SIM_SENSOR_MAX: u32 = 4096;

/// Simulated transport; clones share the same devices
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<SimState>,
}

#[derive(Default)]
struct SimState {
    inner: Mutex<SimInner>,
}

#[derive(Default)]
struct SimInner {
    devices: Vec<DeviceDescriptor>,
    open: HashMap<String, OpenDevice>,
    next_handle: u64,
    open_attempts: u32,
    failing_opens: u32,
    offline: bool,
    rejection: Option<String>,
    start_failure: Option<String>,
    frame_interval: Option<Duration>,
    formats: Option<Vec<PixelFormat>>,
}

struct OpenDevice {
    handle: DeviceHandle,
    config: Option<StreamConfiguration>,
    payload_size: usize,
    queue: VecDeque<BufferLease>,
    sink: Option<FrameSink>,
    next_block_id: u64,
    started_at: Instant,
    ticker: Option<Ticker>,
    controls: Vec<Control>,
    serial: Vec<Vec<u8>>,
}

impl OpenDevice {
    fn is_streaming(&self) -> bool {
        self.sink.is_some()
    }
}

/// Timer thread emitting frames at the configured interval
struct Ticker {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl Ticker {
    fn stop(self) {
        drop(self.stop);
        if self.thread.thread().id() != thread::current().id() {
            let _ = self.thread.join();
        }
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a camera with the given id
    pub fn with_camera(self, id: &str) -> Self {
        self.with_device(DeviceDescriptor {
            id: id.to_string(),
            vendor: "Simulated".to_string(),
            model: "SimCam".to_string(),
            address: format!("sim://{id}"),
        })
    }

    pub fn with_device(self, device: DeviceDescriptor) -> Self {
        self.lock().devices.push(device);
        self
    }

    /// Emit frames from a timer thread while streaming
    pub fn with_frame_interval(self, interval: Duration) -> Self {
        self.lock().frame_interval = Some(interval);
        self
    }

    /// Restrict the pixel formats the sensor accepts
    pub fn with_supported_formats(self, formats: &[PixelFormat]) -> Self {
        self.lock().formats = Some(formats.to_vec());
        self
    }

    /// The next `count` opens fail with an I/O error
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    /// Every open fails while `offline` is set
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// The next configuration is rejected with this message
    pub fn reject_next_configuration(&self, message: &str) {
        self.lock().rejection = Some(message.to_string());
    }

    /// The next stream start fails with this message
    pub fn fail_next_start(&self, message: &str) {
        self.lock().start_failure = Some(message.to_string());
    }

    /// Total `open` calls so far, successful or not
    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    pub fn is_open(&self, device_id: &str) -> bool {
        self.lock().open.contains_key(device_id)
    }

    pub fn is_streaming(&self, device_id: &str) -> bool {
        self.lock()
            .open
            .get(device_id)
            .is_some_and(OpenDevice::is_streaming)
    }

    /// Buffers registered and waiting to be filled
    pub fn queued_buffers(&self, device_id: &str) -> usize {
        self.lock()
            .open
            .get(device_id)
            .map_or(0, |device| device.queue.len())
    }

    /// Controls written to an open device, oldest first
    pub fn written_controls(&self, device_id: &str) -> Vec<Control> {
        self.lock()
            .open
            .get(device_id)
            .map(|device| device.controls.clone())
            .unwrap_or_default()
    }

    /// Serial writes to an open device, oldest first
    pub fn serial_writes(&self, device_id: &str) -> Vec<Vec<u8>> {
        self.lock()
            .open
            .get(device_id)
            .map(|device| device.serial.clone())
            .unwrap_or_default()
    }

    /// Fill the oldest queued buffer and deliver it
    ///
    /// The block id advances even when no buffer is queued, which shows up
    /// downstream as a dropped frame. Returns the delivered block id.
    pub fn emit_frame(&self, device_id: &str) -> Option<u64> {
        self.fill_next(device_id, true)
    }

    /// Deliver a buffer flagged as an incomplete transfer
    pub fn emit_incomplete_frame(&self, device_id: &str) -> Option<u64> {
        self.fill_next(device_id, false)
    }

    /// Advance the block id without delivering anything
    pub fn skip_frames(&self, device_id: &str, count: u64) {
        if let Some(device) = self.lock().open.get_mut(device_id) {
            device.next_block_id += count;
        }
    }

    /// Report a stream failure, as a link loss would
    pub fn inject_error(&self, device_id: &str, message: &str) {
        let sink = self
            .lock()
            .open
            .get(device_id)
            .and_then(|device| device.sink.clone());
        if let Some(sink) = sink {
            warn!(device = device_id, message, "Injecting transport error");
            sink.report_error(message);
        }
    }

    fn fill_next(&self, device_id: &str, valid: bool) -> Option<u64> {
        let mut inner = self.lock();
        let device = inner.open.get_mut(device_id)?;
        let sink = device.sink.clone()?;
        let config = device.config.clone()?;

        let block_id = device.next_block_id;
        device.next_block_id += 1;

        let Some(buffer) = device.queue.pop_front() else {
            debug!(device = device_id, block_id, "No buffer queued, frame lost");
            return None;
        };

        let used = device.payload_size.min(buffer.capacity());
        let written = buffer.write(|data| {
            for (i, byte) in data[..used].iter_mut().enumerate() {
                *byte = (block_id as usize).wrapping_add(i) as u8;
            }
        });
        if written.is_err() {
            // Reclaimed under us (session closing); the lease is inert
            return None;
        }

        let meta = FrameMetadata {
            // Assigned at dispatch
            sequence: 0,
            block_id,
            width: config.width,
            height: config.height,
            stride: 0,
            format: config.pixel_format,
            device_timestamp: Some(device.started_at.elapsed()),
            bytes_used: used,
            valid,
        };
        buffer.mark_ready(meta).ok()?;

        // Delivered under the lock so concurrent emitters keep block id order
        sink.deliver(buffer).then_some(block_id)
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.state
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn device_mut<'a>(
        inner: &'a mut SimInner,
        handle: &DeviceHandle,
    ) -> Result<&'a mut OpenDevice, TransportError> {
        inner
            .open
            .get_mut(handle.device_id())
            .filter(|device| device.handle == *handle)
            .ok_or(TransportError::NotOpen)
    }

    fn spawn_ticker(&self, device_id: &str, interval: Duration) -> Option<Ticker> {
        let (stop, stopped) = flume::bounded::<()>(0);
        let transport = self.clone();
        let device_id = device_id.to_string();
        let spawned = thread::Builder::new()
            .name(format!("sim-{device_id}"))
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        transport.emit_frame(&device_id);
                    }
                    _ => break,
                }
            });
        match spawned {
            Ok(thread) => Some(Ticker { stop, thread }),
            Err(e) => {
                warn!("Failed to spawn simulator thread: {}", e);
                None
            }
        }
    }
}

impl Transport for SimulatedTransport {
    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(self.lock().devices.clone())
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<DeviceHandle, TransportError> {
        let mut inner = self.lock();
        inner.open_attempts += 1;

        if inner.offline {
            return Err(TransportError::Io(format!("{} is unreachable", device.id)));
        }
        if inner.failing_opens > 0 {
            inner.failing_opens -= 1;
            return Err(TransportError::Io(format!("{} did not answer", device.id)));
        }
        if !inner.devices.iter().any(|d| d.id == device.id) {
            return Err(TransportError::NotFound(device.id.clone()));
        }
        if inner.open.contains_key(&device.id) {
            return Err(TransportError::Busy(device.id.clone()));
        }

        inner.next_handle += 1;
        let handle = DeviceHandle::new(inner.next_handle, device.id.clone());
        inner.open.insert(
            device.id.clone(),
            OpenDevice {
                handle: handle.clone(),
                config: None,
                payload_size: 0,
                queue: VecDeque::new(),
                sink: None,
                next_block_id: 0,
                started_at: Instant::now(),
                ticker: None,
                controls: Vec::new(),
                serial: Vec::new(),
            },
        );
        info!(device = %device.id, handle = handle.id(), "Simulated device opened");
        Ok(handle)
    }

    fn close(&self, handle: &DeviceHandle) {
        let removed = {
            let mut inner = self.lock();
            match inner.open.get(handle.device_id()) {
                Some(device) if device.handle == *handle => inner.open.remove(handle.device_id()),
                _ => None,
            }
        };
        if let Some(mut device) = removed {
            if let Some(ticker) = device.ticker.take() {
                ticker.stop();
            }
            debug!(device = handle.device_id(), "Simulated device closed");
        }
    }

    fn apply_configuration(
        &self,
        handle: &DeviceHandle,
        config: &StreamConfiguration,
    ) -> Result<StreamAck, TransportError> {
        let mut inner = self.lock();
        if let Some(message) = inner.rejection.take() {
            return Err(TransportError::Rejected(message));
        }
        if let Some(formats) = &inner.formats {
            if !formats.contains(&config.pixel_format) {
                return Err(TransportError::Rejected(format!(
                    "PixelFormat {} not available",
                    config.pixel_format
                )));
            }
        }
        if config.width > SIM_SENSOR_MAX || config.height > SIM_SENSOR_MAX {
            return Err(TransportError::Rejected(format!(
                "{}x{} exceeds sensor maximum {SIM_SENSOR_MAX}x{SIM_SENSOR_MAX}",
                config.width, config.height
            )));
        }

        let device = Self::device_mut(&mut inner, handle)?;
        if device.is_streaming() {
            return Err(TransportError::Rejected(
                "stream parameters are locked while streaming".to_string(),
            ));
        }
        device.payload_size = config.frame_size();
        device.config = Some(config.clone());
        Ok(StreamAck {
            payload_size: device.payload_size,
        })
    }

    fn register_buffer(
        &self,
        handle: &DeviceHandle,
        buffer: BufferLease,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let device = Self::device_mut(&mut inner, handle)?;
        if buffer.capacity() < device.payload_size {
            return Err(TransportError::Io(format!(
                "buffer of {} bytes cannot hold a {} byte payload",
                buffer.capacity(),
                device.payload_size
            )));
        }
        device.queue.push_back(buffer);
        Ok(())
    }

    fn start_stream(&self, handle: &DeviceHandle, sink: FrameSink) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if let Some(message) = inner.start_failure.take() {
            return Err(TransportError::Io(message));
        }
        let interval = inner.frame_interval;
        let device = Self::device_mut(&mut inner, handle)?;
        if device.config.is_none() {
            return Err(TransportError::Io("stream is not configured".to_string()));
        }
        if device.is_streaming() {
            return Err(TransportError::Io("stream already running".to_string()));
        }

        device.sink = Some(sink);
        device.next_block_id = 0;
        device.started_at = Instant::now();
        let device_id = handle.device_id().to_string();
        drop(inner);

        if let Some(ticker) = interval.and_then(|i| self.spawn_ticker(&device_id, i)) {
            let mut inner = self.lock();
            match Self::device_mut(&mut inner, handle) {
                Ok(device) if device.is_streaming() => device.ticker = Some(ticker),
                _ => {
                    drop(inner);
                    ticker.stop();
                }
            }
        }
        info!(device = %device_id, "Simulated stream started");
        Ok(())
    }

    fn stop_stream(&self, handle: &DeviceHandle) -> Result<(), TransportError> {
        let (ticker, queued) = {
            let mut inner = self.lock();
            let device = Self::device_mut(&mut inner, handle)?;
            device.sink = None;
            let queued: Vec<BufferLease> = device.queue.drain(..).collect();
            (device.ticker.take(), queued)
        };
        if let Some(ticker) = ticker {
            ticker.stop();
        }
        debug!(
            device = handle.device_id(),
            returned = queued.len(),
            "Simulated stream stopped"
        );
        Ok(())
    }

    fn write_control(&self, handle: &DeviceHandle, control: &Control) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let device = Self::device_mut(&mut inner, handle)?;
        debug!(feature = control.feature_name(), "Control written");
        device.controls.push(control.clone());
        Ok(())
    }

    fn write_serial(&self, handle: &DeviceHandle, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let device = Self::device_mut(&mut inner, handle)?;
        device.serial.push(data.to_vec());
        Ok(())
    }
}
