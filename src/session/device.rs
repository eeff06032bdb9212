//! Device session lifecycle
//!
//! A `Session` owns one physical camera from open to close. Every state
//! change happens under the session lock; readers see the state through a
//! lock-free mirror. Streaming runs on a per-stream dispatch thread, and a
//! supervisor thread handles faults and reconnects.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender};
use once_cell::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::capture::controls::{focus_packet, Control};
use crate::capture::decoder::ImageDecoder;
use crate::capture::frame::Frame;
use crate::clock::Clock;
use crate::error::{CameraError, Result};
use crate::pipeline::dispatch::{
    lock_tracker, DeliveryMode, DispatchHandle, DispatchObserver, DispatchSettings, Dispatcher,
    FrameReceiver, Outputs, Replenish, SharedTracker,
};
use crate::pipeline::pool::{BufferLease, BufferPool, BufferState, PoolCensus};
use crate::pipeline::stats::{PipelineStats, SessionStats};
use crate::session::monitor::{
    FaultEvent, FaultKind, FaultMonitor, FaultSignal, ReconnectPolicy, Recoverable,
};
use crate::session::registry::{DeviceRegistry, RegistryLease};
use crate::session::state::{SessionState, StateCell};
use crate::transport::{DeviceDescriptor, DeviceHandle, FrameSink, Transport, TransportError};
use crate::StreamConfiguration;

/// Extra room in the transport channel beyond one slot per buffer
const SINK_SLACK: usize = 8;

/// Per-session tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub delivery: DeliveryMode,
    /// Fault when the transport goes quiet for this long
    pub heartbeat_timeout: Option<Duration>,
    /// Fault when no buffer has been queued for this long
    pub starvation_grace: Duration,
    pub dispatch_tick: Duration,
    pub dispatch_cpu: Option<usize>,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::SingleQueue,
            heartbeat_timeout: Some(Duration::from_secs(3)),
            starvation_grace: Duration::from_secs(1),
            dispatch_tick: Duration::from_millis(20),
            dispatch_cpu: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// This sequence number never arrived
    DroppedFrame { sequence: u64 },
    Closed,
}

impl SessionEvent {
    /// The non-fatal error an event stands for, if any
    pub fn error(&self) -> Option<CameraError> {
        match self {
            SessionEvent::DroppedFrame { sequence } => Some(CameraError::DroppedFrame(*sequence)),
            _ => None,
        }
    }
}

#[derive(Default)]
struct EventHub {
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
}

impl EventHub {
    fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = flume::unbounded();
        self.lock().push(tx);
        rx
    }

    fn publish(&self, event: SessionEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sender<SessionEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a dispatch loop reports: dropped frames to subscribers, faults to the supervisor
struct SessionObserver {
    events: Arc<EventHub>,
    faults: Sender<FaultSignal>,
}

impl DispatchObserver for SessionObserver {
    fn dropped_frame(&self, sequence: u64) {
        self.events.publish(SessionEvent::DroppedFrame { sequence });
    }

    fn fault(&self, generation: u64, kind: FaultKind) {
        let _ = self.faults.send(FaultSignal { generation, kind });
    }
}

/// Requeues free buffers with the device of one stream
struct StreamLink {
    transport: Arc<dyn Transport>,
    handle: DeviceHandle,
}

impl Replenish for StreamLink {
    fn requeue(&self, buffer: BufferLease) -> std::result::Result<(), TransportError> {
        self.transport.register_buffer(&self.handle, buffer)
    }
}

struct Supervisor {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

/// Threads to wait for once the session lock is released
#[derive(Default)]
struct Leftovers {
    dispatch: Option<DispatchHandle>,
    supervisor: Option<JoinHandle<()>>,
}

impl Leftovers {
    fn join(self) {
        if let Some(dispatch) = self.dispatch {
            dispatch.join();
        }
        if let Some(thread) = self.supervisor {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

struct Core {
    state: SessionState,
    descriptor: Option<DeviceDescriptor>,
    registry_lease: Option<RegistryLease>,
    handle: Option<DeviceHandle>,
    config: Option<StreamConfiguration>,
    pool: Option<BufferPool>,
    dispatch: Option<DispatchHandle>,
    supervisor: Option<Supervisor>,
    generation: u64,
    close_reason: Option<CameraError>,
}

impl Core {
    fn device_id(&self) -> &str {
        self.descriptor.as_ref().map_or("-", |d| d.id.as_str())
    }
}

pub(crate) struct SessionParts {
    pub transport: Arc<dyn Transport>,
    pub registry: DeviceRegistry,
    pub decoder: Arc<dyn ImageDecoder>,
    pub clock: Arc<dyn Clock>,
    pub options: SessionOptions,
}

struct Shared {
    me: Weak<Shared>,
    transport: Arc<dyn Transport>,
    registry: DeviceRegistry,
    decoder: Arc<dyn ImageDecoder>,
    clock: Arc<dyn Clock>,
    options: SessionOptions,
    monitor: Arc<FaultMonitor>,
    outputs: Arc<Outputs>,
    primary: OnceCell<FrameReceiver>,
    sequences: SharedTracker,
    stats: Arc<PipelineStats>,
    events: Arc<EventHub>,
    faults_tx: Sender<FaultSignal>,
    faults_rx: Receiver<FaultSignal>,
    state: StateCell,
    core: Mutex<Core>,
}

/// Session with one camera (DeviceSession)
///
/// ```text
/// Disconnected -> Connecting -> Configured <-> Streaming
///                                   ^             |
///                             Reconnecting <- Faulted
/// any state -> Closed
/// ```
///
/// Dropping the session closes it.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let SessionParts {
            transport,
            registry,
            decoder,
            clock,
            options,
        } = parts;
        let (faults_tx, faults_rx) = flume::unbounded();
        let monitor = Arc::new(FaultMonitor::new(
            options.reconnect.clone(),
            Arc::clone(&clock),
        ));
        let outputs = Arc::new(Outputs::new(options.delivery));

        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            transport,
            registry,
            decoder,
            clock,
            options,
            monitor,
            outputs,
            primary: OnceCell::new(),
            sequences: SharedTracker::default(),
            stats: Arc::new(PipelineStats::default()),
            events: Arc::new(EventHub::default()),
            faults_tx,
            faults_rx,
            state: StateCell::new(SessionState::Disconnected),
            core: Mutex::new(Core {
                state: SessionState::Disconnected,
                descriptor: None,
                registry_lease: None,
                handle: None,
                config: None,
                pool: None,
                dispatch: None,
                supervisor: None,
                generation: 0,
                close_reason: None,
            }),
        });
        Self { shared }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.load()
    }

    /// Disconnected -> Connecting
    #[instrument(skip(self, device), fields(device_id = %device.id))]
    pub fn open(&self, device: &DeviceDescriptor) -> Result<()> {
        let shared = &self.shared;
        let mut core = shared.lock();
        if core.state != SessionState::Disconnected {
            return Err(CameraError::invalid_state(
                core.state,
                SessionState::Connecting,
            ));
        }

        let lease = shared.registry.check_out(&device.id)?;
        let handle = shared
            .transport
            .open(device)
            .map_err(CameraError::from_open)?;

        core.descriptor = Some(device.clone());
        core.registry_lease = Some(lease);
        core.handle = Some(handle);
        shared.commit(&mut core, SessionState::Connecting)
    }

    /// Connecting or Configured -> Configured; stream parameters are fixed from here
    #[instrument(skip_all)]
    pub fn apply_configuration(&self, config: StreamConfiguration) -> Result<()> {
        let shared = &self.shared;
        let mut core = shared.lock();
        if !matches!(
            core.state,
            SessionState::Connecting | SessionState::Configured
        ) {
            return Err(CameraError::invalid_state(
                core.state,
                SessionState::Configured,
            ));
        }
        config.validate()?;

        let handle = shared.handle(&core)?;
        let ack = shared
            .transport
            .apply_configuration(&handle, &config)
            .map_err(CameraError::from_configure)?;
        let size = match ack.payload_size {
            0 => config.frame_size(),
            n => n,
        };
        let count = config.buffer_count as usize;

        let pool = match core.pool.take() {
            Some(pool) if pool.capacity() == count && pool.buffer_size() >= size => pool,
            previous => {
                if let Some(previous) = previous {
                    previous.close();
                }
                BufferPool::preallocate(count, size)?
            }
        };
        info!(
            device = core.device_id(),
            format = %config.pixel_format,
            width = config.width,
            height = config.height,
            buffers = count,
            buffer_size = pool.buffer_size(),
            "Stream configured"
        );
        core.pool = Some(pool);
        core.config = Some(config);
        shared.commit(&mut core, SessionState::Configured)
    }

    /// Configured -> Streaming
    #[instrument(skip_all)]
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let mut core = shared.lock();
        if core.state != SessionState::Configured {
            return Err(CameraError::invalid_state(
                core.state,
                SessionState::Streaming,
            ));
        }
        shared.start_stream(&mut core)?;
        shared.commit(&mut core, SessionState::Streaming)
    }

    /// Streaming -> Configured; frames already delivered stay valid
    #[instrument(skip_all)]
    pub fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        let mut core = shared.lock();
        if core.state != SessionState::Streaming {
            return Err(CameraError::invalid_state(
                core.state,
                SessionState::Configured,
            ));
        }
        shared.halt_stream(&mut core);
        shared.commit(&mut core, SessionState::Configured)
    }

    /// Any state -> Closed
    ///
    /// Waits for an in-flight transition, stops streaming, reclaims every
    /// buffer and wakes all waiters with `SessionClosed`. Closing twice is a
    /// no-op.
    #[instrument(skip_all)]
    pub fn close(&self) -> Result<()> {
        let leftovers = {
            let mut core = self.shared.lock();
            if core.state == SessionState::Closed {
                return Ok(());
            }
            self.shared.shut_down(&mut core, None)
        };
        leftovers.join();
        Ok(())
    }

    pub fn set_gain(&self, gain: f64) -> Result<()> {
        self.shared.write_control(Control::Gain(gain))
    }

    /// Exposure time in microseconds
    pub fn set_exposure_time(&self, micros: f64) -> Result<()> {
        self.shared.write_control(Control::ExposureTime(micros))
    }

    pub fn set_auto_exposure(&self, enabled: bool) -> Result<()> {
        self.shared.write_control(Control::AutoExposure(enabled))
    }

    pub fn set_frame_rate(&self, fps: f64) -> Result<()> {
        self.shared.write_control(Control::FrameRate(fps))
    }

    pub fn enable_lens_power(&self, enabled: bool) -> Result<()> {
        self.shared.write_control(Control::LensPower(enabled))
    }

    /// Route the device serial port to the lens, e.g. `"Baud57600"`
    pub fn setup_lens_serial(&self, baud_rate: &str) -> Result<()> {
        self.shared.write_control(Control::LensSerial {
            baud_rate: baud_rate.to_string(),
        })
    }

    /// Drive the liquid lens; the voltage is clamped to the driver's range
    pub fn set_lens_focus(&self, voltage: f64) -> Result<()> {
        let shared = &self.shared;
        let core = shared.lock();
        let handle = shared.control_handle(&core)?;
        let packet = focus_packet(voltage);
        debug!(voltage, ?packet, "Setting lens focus");
        shared.transport.write_serial(&handle, &packet)?;
        Ok(())
    }

    /// Oldest queued frame
    pub fn next_frame(&self, timeout: Duration) -> Result<Frame> {
        self.shared.primary().next_frame(timeout)
    }

    /// Newest queued frame, discarding older ones
    pub fn latest_frame(&self, timeout: Duration) -> Result<Frame> {
        self.shared.primary().latest_frame(timeout)
    }

    /// First frame to arrive after this call
    pub fn next_new_frame(&self, timeout: Duration) -> Result<Frame> {
        self.shared.primary().next_new_frame(timeout)
    }

    /// Another receiver: competes for frames in single-queue mode,
    /// sees every frame in broadcast mode
    pub fn frames(&self) -> FrameReceiver {
        self.shared.outputs.receiver()
    }

    /// Run `callback` on the dispatch thread for every frame
    pub fn on_frame(&self, callback: impl Fn(&Frame) + Send + Sync + 'static) {
        self.shared.outputs.add_callback(Arc::new(callback));
    }

    pub fn on_fault(&self, handler: impl Fn(&FaultEvent) + Send + Sync + 'static) {
        self.shared.monitor.subscribe(Arc::new(handler));
    }

    /// State changes, dropped frames and closure, from now on
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.snapshot()
    }

    /// Buffer states, once a pool exists
    pub fn pool_census(&self) -> Option<PoolCensus> {
        self.shared.lock().pool.as_ref().map(BufferPool::census)
    }

    /// Why the session closed, when it did not close on request
    pub fn close_reason(&self) -> Option<CameraError> {
        self.shared.lock().close_reason.clone()
    }

    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.shared.lock().descriptor.clone()
    }

    pub fn configuration(&self) -> Option<StreamConfiguration> {
        self.shared.lock().config.clone()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.shared.options
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn primary(&self) -> &FrameReceiver {
        self.primary.get_or_init(|| self.outputs.receiver())
    }

    fn commit(&self, core: &mut Core, next: SessionState) -> Result<()> {
        let from = core.state;
        if !from.can_transition(next) {
            return Err(CameraError::invalid_state(from, next));
        }
        core.state = next;
        self.state.store(next);
        if from != next {
            info!(device = core.device_id(), %from, to = %next, "Session state changed");
            self.events
                .publish(SessionEvent::StateChanged { from, to: next });
        }
        Ok(())
    }

    fn handle(&self, core: &Core) -> Result<DeviceHandle> {
        core.handle
            .clone()
            .ok_or_else(|| CameraError::Transport(TransportError::NotOpen.to_string()))
    }

    /// Controls need an open device handle
    fn control_handle(&self, core: &Core) -> Result<DeviceHandle> {
        if !core.state.holds_device() {
            return Err(CameraError::invalid_state(
                core.state,
                SessionState::Configured,
            ));
        }
        self.handle(core)
    }

    fn write_control(&self, control: Control) -> Result<()> {
        let core = self.lock();
        let handle = self.control_handle(&core)?;
        debug!(feature = control.feature_name(), ?control, "Writing control");
        self.transport.write_control(&handle, &control)?;
        Ok(())
    }

    fn ensure_supervisor(&self, core: &mut Core) -> Result<()> {
        if core.supervisor.is_some() {
            return Ok(());
        }
        let (shutdown, stopped) = flume::bounded::<()>(0);
        let thread = self.monitor.spawn_supervisor(
            format!("supervisor-{}", core.device_id()),
            self.me.clone(),
            self.faults_rx.clone(),
            stopped,
        )?;
        core.supervisor = Some(Supervisor { shutdown, thread });
        Ok(())
    }

    /// Queue every free buffer, start the device and spawn the dispatch loop
    fn start_stream(&self, core: &mut Core) -> Result<()> {
        let handle = self.handle(core)?;
        let pool = core
            .pool
            .clone()
            .ok_or_else(|| CameraError::StartFailed("no buffer pool configured".to_string()))?;
        self.ensure_supervisor(core)?;

        let mut primed = 0;
        loop {
            match pool.checkout_for_fill() {
                Ok(buffer) => {
                    if let Err(e) = self.transport.register_buffer(&handle, buffer) {
                        self.abandon_start(&handle, &pool);
                        return Err(CameraError::from_start(e));
                    }
                    primed += 1;
                }
                Err(CameraError::PoolEmpty) => break,
                Err(e) => {
                    self.abandon_start(&handle, &pool);
                    return Err(e);
                }
            }
        }

        let (sink, events) = FrameSink::channel(pool.capacity() + SINK_SLACK);
        if let Err(e) = self.transport.start_stream(&handle, sink) {
            warn!(device = core.device_id(), "Stream start failed: {}", e);
            self.abandon_start(&handle, &pool);
            return Err(CameraError::from_start(e));
        }

        // The device counts blocks from scratch; session numbering carries on
        lock_tracker(&self.sequences).new_stream();
        core.generation += 1;
        let dispatcher = Dispatcher {
            device_id: core.device_id().to_string(),
            generation: core.generation,
            events,
            pool: pool.clone(),
            sequences: Arc::clone(&self.sequences),
            link: Arc::new(StreamLink {
                transport: Arc::clone(&self.transport),
                handle: handle.clone(),
            }),
            outputs: Arc::clone(&self.outputs),
            stats: Arc::clone(&self.stats),
            decoder: Arc::clone(&self.decoder),
            clock: Arc::clone(&self.clock),
            observer: Arc::new(SessionObserver {
                events: Arc::clone(&self.events),
                faults: self.faults_tx.clone(),
            }),
            settings: DispatchSettings {
                heartbeat_timeout: self.options.heartbeat_timeout,
                starvation_grace: self.options.starvation_grace,
                tick: self.options.dispatch_tick,
                cpu: self.options.dispatch_cpu,
            },
        };
        match dispatcher.spawn() {
            Ok(dispatch) => core.dispatch = Some(dispatch),
            Err(e) => {
                let _ = self.transport.stop_stream(&handle);
                self.abandon_start(&handle, &pool);
                return Err(e);
            }
        }

        info!(
            device = core.device_id(),
            generation = core.generation,
            primed,
            "Stream started"
        );
        Ok(())
    }

    /// Take back every buffer handed to the transport for a failed start
    fn abandon_start(&self, handle: &DeviceHandle, pool: &BufferPool) {
        let _ = self.transport.stop_stream(handle);
        let reclaimed = pool.reclaim(&[BufferState::Queued]);
        if reclaimed > 0 {
            debug!(reclaimed, "Reclaimed buffers after failed start");
        }
    }

    /// Stop the dispatch loop, then the device; queued buffers return to the pool
    fn halt_stream(&self, core: &mut Core) {
        if let Some(dispatch) = core.dispatch.take() {
            dispatch.stop();
        }
        if let Some(handle) = &core.handle {
            if let Err(e) = self.transport.stop_stream(handle) {
                warn!(device = core.device_id(), "Stream stop failed: {}", e);
            }
        }
        if let Some(pool) = &core.pool {
            pool.reclaim(&[BufferState::Queued]);
        }
    }

    /// Move to Closed; threads are returned for joining outside the lock
    fn shut_down(&self, core: &mut Core, reason: Option<CameraError>) -> Leftovers {
        let mut dispatch = core.dispatch.take();
        if let Some(dispatch) = dispatch.as_mut() {
            dispatch.signal();
        }
        if let Some(handle) = core.handle.take() {
            if core.state == SessionState::Streaming {
                let _ = self.transport.stop_stream(&handle);
            }
            self.transport.close(&handle);
        }
        core.registry_lease = None;
        if let Some(pool) = &core.pool {
            pool.close();
        }
        self.outputs.close();

        core.close_reason = reason;
        let _ = self.commit(core, SessionState::Closed);
        self.events.publish(SessionEvent::Closed);

        let supervisor = core.supervisor.take().map(|supervisor| {
            drop(supervisor.shutdown);
            supervisor.thread
        });
        Leftovers {
            dispatch,
            supervisor,
        }
    }
}

impl Recoverable for Shared {
    fn begin_recovery(&self, generation: u64, kind: &FaultKind) -> bool {
        let mut core = self.lock();
        if core.state != SessionState::Streaming || core.generation != generation {
            return false;
        }
        warn!(device = core.device_id(), generation, fault = %kind, "Session faulted");

        self.halt_stream(&mut core);
        if let Some(handle) = core.handle.take() {
            self.transport.close(&handle);
        }
        self.commit(&mut core, SessionState::Faulted).is_ok()
    }

    fn enter_reconnecting(&self) -> bool {
        let mut core = self.lock();
        self.commit(&mut core, SessionState::Reconnecting).is_ok()
    }

    fn attempt_reconnect(&self) -> Result<()> {
        let mut core = self.lock();
        match core.state {
            SessionState::Reconnecting => {}
            SessionState::Closed => return Err(CameraError::SessionClosed),
            other => return Err(CameraError::invalid_state(other, SessionState::Configured)),
        }
        let (Some(device), Some(config)) = (core.descriptor.clone(), core.config.clone()) else {
            return Err(CameraError::SessionClosed);
        };

        let handle = self
            .transport
            .open(&device)
            .map_err(CameraError::from_open)?;
        let configured = self
            .transport
            .apply_configuration(&handle, &config)
            .map_err(CameraError::from_configure)
            .and_then(|ack| {
                let pool_size = core.pool.as_ref().map_or(0, BufferPool::buffer_size);
                if ack.payload_size > pool_size {
                    Err(CameraError::UnsupportedConfiguration(format!(
                        "payload grew to {} bytes, buffers hold {pool_size}",
                        ack.payload_size
                    )))
                } else {
                    Ok(())
                }
            });
        if let Err(e) = configured {
            self.transport.close(&handle);
            return Err(e);
        }

        core.handle = Some(handle.clone());
        if let Err(e) = self.start_stream(&mut core) {
            core.handle = None;
            self.transport.close(&handle);
            return Err(e);
        }

        self.commit(&mut core, SessionState::Configured)?;
        self.commit(&mut core, SessionState::Streaming)?;
        self.stats.reconnected();
        Ok(())
    }

    fn give_up(&self, attempts: u32, last_error: String) {
        let leftovers = {
            let mut core = self.lock();
            if core.state == SessionState::Closed {
                return;
            }
            let reason = CameraError::ReconnectExhausted {
                attempts,
                last_error,
            };
            self.shut_down(&mut core, Some(reason))
        };
        leftovers.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::decoder::StandardDecoder;
    use crate::clock::ManualClock;
    use crate::transport::SimulatedTransport;

    fn session(sim: &SimulatedTransport) -> Session {
        Session::new(SessionParts {
            transport: Arc::new(sim.clone()),
            registry: DeviceRegistry::new(),
            decoder: Arc::new(StandardDecoder),
            clock: Arc::new(ManualClock::new()),
            options: SessionOptions::default(),
        })
    }

    fn small() -> StreamConfiguration {
        StreamConfiguration {
            width: 8,
            height: 4,
            buffer_count: 3,
            ..Default::default()
        }
    }

    fn device(sim: &SimulatedTransport) -> DeviceDescriptor {
        sim.enumerate_devices().unwrap().remove(0)
    }

    #[test]
    fn test_start_from_disconnected_is_invalid() {
        let sim = SimulatedTransport::new().with_camera("cam-0");
        let session = session(&sim);
        match session.start() {
            Err(CameraError::InvalidState { current, attempted }) => {
                assert_eq!(current, SessionState::Disconnected);
                assert_eq!(attempted, SessionState::Streaming);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_reconfigure_reuses_matching_pool() {
        let sim = SimulatedTransport::new().with_camera("cam-0");
        let session = session(&sim);
        session.open(&device(&sim)).unwrap();
        session.apply_configuration(small()).unwrap();
        session.apply_configuration(small()).unwrap();
        assert_eq!(session.state(), SessionState::Configured);
        assert_eq!(session.pool_census().unwrap().free, 3);
    }

    #[test]
    fn test_controls_need_an_open_device() {
        let sim = SimulatedTransport::new().with_camera("cam-0");
        let session = session(&sim);
        assert!(matches!(
            session.set_gain(2.0),
            Err(CameraError::InvalidState { .. })
        ));

        session.open(&device(&sim)).unwrap();
        session.set_gain(2.0).unwrap();
        session.set_exposure_time(1500.0).unwrap();
        session.set_lens_focus(30.0).unwrap();
        assert_eq!(
            sim.written_controls("cam-0"),
            vec![Control::Gain(2.0), Control::ExposureTime(1500.0)]
        );
        assert_eq!(sim.serial_writes("cam-0"), vec![focus_packet(30.0).to_vec()]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let sim = SimulatedTransport::new().with_camera("cam-0");
        let session = session(&sim);
        session.open(&device(&sim)).unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!sim.is_open("cam-0"));
        assert!(session.close_reason().is_none());
    }

    #[test]
    fn test_dropped_frame_event_maps_to_error() {
        let event = SessionEvent::DroppedFrame { sequence: 9 };
        assert!(matches!(event.error(), Some(CameraError::DroppedFrame(9))));
        assert!(SessionEvent::Closed.error().is_none());
    }
}
