//! V4L2 transport for UVC and other Video4Linux capture devices
//!
//! Frames are dequeued from driver-owned mmap buffers on a capture thread
//! and copied into pooled buffers registered by the session.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Sender, TryRecvError};
use tracing::{debug, info, instrument, warn};
use v4l::buffer::{Flags as BufFlags, Type};
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control as V4lControl, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{DeviceDescriptor, DeviceHandle, FrameSink, StreamAck, Transport, TransportError};
use crate::capture::controls::Control;
use crate::capture::frame::{FrameMetadata, PixelFormat};
use crate::pipeline::pool::BufferLease;
use crate::StreamConfiguration;

/// Device nodes probed during enumeration
const MAX_VIDEO_NODES: u32 = 10;
/// Dequeue timeout, bounds how long a stop request waits
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

type BufferQueue = Arc<Mutex<VecDeque<BufferLease>>>;

fn lock_queue(queue: &BufferQueue) -> MutexGuard<'_, VecDeque<BufferLease>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mono8 => FourCC::new(b"GREY"),
        PixelFormat::Mono10 => FourCC::new(b"Y10 "),
        PixelFormat::Mono12 => FourCC::new(b"Y12 "),
        PixelFormat::Mono14 => FourCC::new(b"Y14 "),
        PixelFormat::Mono16 => FourCC::new(b"Y16 "),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Nv12 => FourCC::new(b"NV12"),
    }
}

fn io_error(err: io::Error) -> TransportError {
    TransportError::Io(err.to_string())
}

/// Negotiated capture format
#[derive(Debug, Clone)]
struct Negotiated {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    buffer_count: u32,
}

struct CaptureThread {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl CaptureThread {
    fn stop(self) {
        drop(self.stop);
        let _ = self.thread.join();
    }
}

struct OpenDevice {
    handle: DeviceHandle,
    device: Device,
    negotiated: Option<Negotiated>,
    queue: BufferQueue,
    capture: Option<CaptureThread>,
}

/// Video4Linux capture transport
#[derive(Default)]
pub struct V4l2Transport {
    open: Mutex<HashMap<String, OpenDevice>>,
    next_handle: AtomicU64,
}

impl V4l2Transport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, OpenDevice>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_device<R>(
        &self,
        handle: &DeviceHandle,
        f: impl FnOnce(&mut OpenDevice) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut open = self.lock();
        let device = open
            .get_mut(handle.device_id())
            .filter(|device| device.handle == *handle)
            .ok_or(TransportError::NotOpen)?;
        f(device)
    }

    /// Find a control by the names V4L2 drivers commonly use for it
    fn set_named_control(
        device: &Device,
        names: &[&str],
        value: Value,
    ) -> Result<(), TransportError> {
        let controls = device.query_controls().map_err(io_error)?;
        let description = controls
            .iter()
            .find(|c| names.iter().any(|name| c.name.eq_ignore_ascii_case(name)))
            .ok_or_else(|| TransportError::Rejected(format!("device has no {} control", names[0])))?;
        device
            .set_control(V4lControl {
                id: description.id,
                value,
            })
            .map_err(io_error)
    }
}

impl Transport for V4l2Transport {
    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        info!("Auto-detecting capture devices...");
        let mut found = Vec::new();
        for i in 0..MAX_VIDEO_NODES {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(device) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = device.query_caps() else {
                continue;
            };
            if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                info!("Found capture device: {} - {}", path, caps.card);
                found.push(DeviceDescriptor {
                    id: path,
                    vendor: caps.driver,
                    model: caps.card,
                    address: caps.bus,
                });
            }
        }
        Ok(found)
    }

    #[instrument(skip(self, descriptor), fields(device = %descriptor.id))]
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle, TransportError> {
        let mut open = self.lock();
        if open.contains_key(&descriptor.id) {
            return Err(TransportError::Busy(descriptor.id.clone()));
        }
        let device = Device::with_path(&descriptor.id).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransportError::NotFound(descriptor.id.clone()),
            io::ErrorKind::PermissionDenied => TransportError::Busy(descriptor.id.clone()),
            _ => io_error(e),
        })?;

        let caps = device.query_caps().map_err(io_error)?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(TransportError::Rejected(
                "Device doesn't support video capture".to_string(),
            ));
        }
        info!("Device: {} ({})", caps.card, caps.driver);

        let handle = DeviceHandle::new(
            self.next_handle.fetch_add(1, Ordering::Relaxed) + 1,
            descriptor.id.clone(),
        );
        open.insert(
            descriptor.id.clone(),
            OpenDevice {
                handle: handle.clone(),
                device,
                negotiated: None,
                queue: Arc::new(Mutex::new(VecDeque::new())),
                capture: None,
            },
        );
        Ok(handle)
    }

    fn close(&self, handle: &DeviceHandle) {
        let removed = {
            let mut open = self.lock();
            match open.get(handle.device_id()) {
                Some(device) if device.handle == *handle => open.remove(handle.device_id()),
                _ => None,
            }
        };
        if let Some(mut device) = removed {
            if let Some(capture) = device.capture.take() {
                capture.stop();
            }
            debug!(device = handle.device_id(), "V4L2 device closed");
        }
    }

    fn apply_configuration(
        &self,
        handle: &DeviceHandle,
        config: &StreamConfiguration,
    ) -> Result<StreamAck, TransportError> {
        self.with_device(handle, |open| {
            if open.capture.is_some() {
                return Err(TransportError::Rejected(
                    "stream parameters are locked while streaming".to_string(),
                ));
            }
            let device = &open.device;
            let mut fmt = device.format().map_err(io_error)?;
            fmt.width = config.width;
            fmt.height = config.height;
            fmt.fourcc = fourcc(config.pixel_format);
            let actual = device.set_format(&fmt).map_err(io_error)?;

            if actual.fourcc != fmt.fourcc
                || actual.width != config.width
                || actual.height != config.height
            {
                return Err(TransportError::Rejected(format!(
                    "device negotiated {} {}x{} instead of {} {}x{}",
                    actual.fourcc,
                    actual.width,
                    actual.height,
                    fmt.fourcc,
                    config.width,
                    config.height
                )));
            }

            let fps = config.frame_rate.round().max(1.0) as u32;
            if let Err(e) = device.set_params(&Parameters::with_fps(fps)) {
                warn!(fps, "Frame rate not applied: {}", e);
            }

            open.negotiated = Some(Negotiated {
                width: actual.width,
                height: actual.height,
                stride: actual.stride,
                format: config.pixel_format,
                buffer_count: config.buffer_count,
            });
            let payload_size = (actual.size as usize).max(config.frame_size());
            Ok(StreamAck { payload_size })
        })
    }

    fn register_buffer(
        &self,
        handle: &DeviceHandle,
        buffer: BufferLease,
    ) -> Result<(), TransportError> {
        self.with_device(handle, |open| {
            lock_queue(&open.queue).push_back(buffer);
            Ok(())
        })
    }

    fn start_stream(&self, handle: &DeviceHandle, sink: FrameSink) -> Result<(), TransportError> {
        self.with_device(handle, |open| {
            if open.capture.is_some() {
                return Err(TransportError::Io("stream already running".to_string()));
            }
            let negotiated = open
                .negotiated
                .clone()
                .ok_or_else(|| TransportError::Io("stream is not configured".to_string()))?;

            let mut stream =
                MmapStream::with_buffers(&open.device, Type::VideoCapture, negotiated.buffer_count)
                    .map_err(io_error)?;
            stream.set_timeout(DEQUEUE_TIMEOUT);

            let (stop, stopped) = flume::bounded::<()>(0);
            let queue = Arc::clone(&open.queue);
            let thread = thread::Builder::new()
                .name(format!("v4l2-{}", handle.device_id()))
                .spawn(move || capture_loop(stream, queue, sink, negotiated, stopped))
                .map_err(io_error)?;
            open.capture = Some(CaptureThread { stop, thread });

            info!("Capture stream started");
            Ok(())
        })
    }

    fn stop_stream(&self, handle: &DeviceHandle) -> Result<(), TransportError> {
        let (capture, queued) = self.with_device(handle, |open| {
            let queued: Vec<BufferLease> = lock_queue(&open.queue).drain(..).collect();
            Ok((open.capture.take(), queued))
        })?;
        if let Some(capture) = capture {
            capture.stop();
        }
        debug!(returned = queued.len(), "Capture stream stopped");
        Ok(())
    }

    fn write_control(&self, handle: &DeviceHandle, control: &Control) -> Result<(), TransportError> {
        self.with_device(handle, |open| {
            let device = &open.device;
            match control {
                Control::Gain(gain) => {
                    Self::set_named_control(device, &["Gain"], Value::Integer(*gain as i64))
                }
                // V4L2 absolute exposure is in 100 us units
                Control::ExposureTime(micros) => Self::set_named_control(
                    device,
                    &["Exposure Time, Absolute", "Exposure (Absolute)", "Exposure"],
                    Value::Integer((*micros / 100.0).round() as i64),
                ),
                Control::AutoExposure(enabled) => Self::set_named_control(
                    device,
                    &["Auto Exposure", "Exposure, Auto"],
                    Value::Integer(if *enabled { 3 } else { 1 }),
                ),
                Control::FrameRate(fps) => device
                    .set_params(&Parameters::with_fps(fps.round().max(1.0) as u32))
                    .map(|_| ())
                    .map_err(io_error),
                Control::LensPower(_) | Control::LensSerial { .. } => {
                    Err(TransportError::Rejected(format!(
                        "{} is not available on V4L2 devices",
                        control.feature_name()
                    )))
                }
            }
        })
    }

    fn write_serial(&self, _handle: &DeviceHandle, _data: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Rejected(
            "V4L2 devices have no serial port".to_string(),
        ))
    }
}

/// Dequeue driver buffers and copy them into registered pool buffers
fn capture_loop(
    mut stream: MmapStream<'static>,
    queue: BufferQueue,
    sink: FrameSink,
    negotiated: Negotiated,
    stopped: flume::Receiver<()>,
) {
    loop {
        if let Err(TryRecvError::Disconnected) = stopped.try_recv() {
            break;
        }

        let (data, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("Capture error: {}", e);
                sink.report_error(e.to_string());
                break;
            }
        };

        let block_id = u64::from(meta.sequence);
        let Some(buffer) = lock_queue(&queue).pop_front() else {
            debug!(block_id, "No buffer queued, frame lost");
            continue;
        };

        let used = (meta.bytesused as usize).min(data.len()).min(buffer.capacity());
        if buffer
            .write(|dst| dst[..used].copy_from_slice(&data[..used]))
            .is_err()
        {
            continue;
        }

        let frame_meta = FrameMetadata {
            // Assigned at dispatch
            sequence: 0,
            block_id,
            width: negotiated.width,
            height: negotiated.height,
            stride: negotiated.stride,
            format: negotiated.format,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
            bytes_used: used,
            valid: !meta.flags.contains(BufFlags::ERROR),
        };
        if buffer.mark_ready(frame_meta).is_ok() {
            sink.deliver(buffer);
        }
    }
}
