//! Frame dispatch loop
//!
//! One dispatch thread runs per stream. It drains filled buffers from the
//! transport, enforces sequence order, publishes frames to consumers and
//! keeps the transport supplied with free buffers. It also owns the
//! heartbeat and starvation watchdogs.

use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use flume::{Receiver, Selector, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capture::decoder::ImageDecoder;
use crate::capture::frame::Frame;
use crate::clock::Clock;
use crate::error::{CameraError, Result};
use crate::pipeline::pool::{BufferLease, BufferPool};
use crate::pipeline::stats::PipelineStats;
use crate::session::monitor::FaultKind;
use crate::transport::{TransportError, TransportEvent};

/// Gaps wider than this are a discontinuity, not a run of dropped frames
pub const MAX_REPORTED_GAP: u64 = 65_536;

/// How frames reach more than one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// One shared FIFO; concurrent receivers compete for frames
    #[default]
    SingleQueue,
    /// Every receiver sees every frame; the buffer is shared, not copied
    Broadcast,
}

/// Callback invoked on the dispatch thread for every published frame
pub type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Verdict on an arriving block id
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    InOrder(u64),
    /// Accepted as `sequence`; the numbers in `missing` never arrived
    Gap { sequence: u64, missing: Range<u64> },
    /// Accepted as `sequence` after too many skipped blocks to report individually
    Discontinuity { sequence: u64, skipped: u64 },
    /// At or behind the last accepted block of this stream
    Stale,
}

/// Maps device block ids onto one session-wide sequence
///
/// Block ids restart with every stream; the session sequence never goes
/// backwards. The first block of a stream continues right after the last
/// accepted frame of the previous one.
#[derive(Debug, Default)]
pub(crate) struct SequenceTracker {
    last_block: Option<u64>,
    next: u64,
    last: Option<u64>,
}

impl SequenceTracker {
    /// Forget the block id baseline; called before every stream start
    pub fn new_stream(&mut self) {
        self.last_block = None;
    }

    pub fn admit(&mut self, block_id: u64) -> Admission {
        let Some(last_block) = self.last_block else {
            self.last_block = Some(block_id);
            return Admission::InOrder(self.accept(self.next));
        };
        if block_id <= last_block {
            return Admission::Stale;
        }
        self.last_block = Some(block_id);

        let skipped = block_id - last_block - 1;
        let expected = self.next;
        let sequence = self.accept(expected + skipped);
        match skipped {
            0 => Admission::InOrder(sequence),
            skipped if skipped > MAX_REPORTED_GAP => Admission::Discontinuity { sequence, skipped },
            _ => Admission::Gap {
                sequence,
                missing: expected..sequence,
            },
        }
    }

    /// Last session sequence handed out
    pub fn last(&self) -> Option<u64> {
        self.last
    }

    fn accept(&mut self, sequence: u64) -> u64 {
        self.last = Some(sequence);
        self.next = sequence + 1;
        sequence
    }
}

/// Tracker shared by every stream generation of one session
pub(crate) type SharedTracker = Arc<Mutex<SequenceTracker>>;

pub(crate) fn lock_tracker(tracker: &SharedTracker) -> MutexGuard<'_, SequenceTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumer-side fan-out, shared by the session and its dispatch threads
pub(crate) struct Outputs {
    mode: DeliveryMode,
    queue_tx: Sender<Frame>,
    queue_rx: Receiver<Frame>,
    subscribers: Mutex<Vec<Sender<Frame>>>,
    callbacks: ArcSwap<Vec<FrameCallback>>,
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
}

impl Outputs {
    pub fn new(mode: DeliveryMode) -> Self {
        let (queue_tx, queue_rx) = flume::unbounded();
        let (closed_tx, closed_rx) = flume::bounded(0);
        Self {
            mode,
            queue_tx,
            queue_rx,
            subscribers: Mutex::new(Vec::new()),
            callbacks: ArcSwap::from_pointee(Vec::new()),
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx,
        }
    }

    /// A new receiver: a competing consumer or an independent subscriber
    pub fn receiver(&self) -> FrameReceiver {
        let frames = match self.mode {
            DeliveryMode::SingleQueue => self.queue_rx.clone(),
            DeliveryMode::Broadcast => {
                let (tx, rx) = flume::unbounded();
                if self.closed_rx.is_disconnected() {
                    drop(tx);
                } else {
                    self.subscribers().push(tx);
                }
                rx
            }
        };
        FrameReceiver {
            frames,
            closed: self.closed_rx.clone(),
        }
    }

    pub fn add_callback(&self, callback: FrameCallback) {
        self.callbacks.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&callback));
            next
        });
    }

    /// Hand a frame to every consumer; false if nobody took it
    pub fn publish(&self, frame: Frame) -> bool {
        let callbacks = self.callbacks.load();
        for callback in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(&frame))).is_err() {
                warn!(sequence = frame.sequence(), "Frame callback panicked");
            }
        }

        match self.mode {
            DeliveryMode::SingleQueue => self.queue_tx.send(frame).is_ok(),
            DeliveryMode::Broadcast => {
                let mut subscribers = self.subscribers();
                subscribers.retain(|tx| tx.send(frame.clone()).is_ok());
                !subscribers.is_empty() || !callbacks.is_empty()
            }
        }
    }

    /// Wake every receiver with `SessionClosed` and drop queued frames
    pub fn close(&self) {
        self.closed_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.subscribers().clear();
        let discarded = self.queue_rx.drain().count();
        if discarded > 0 {
            debug!(discarded, "Discarded undelivered frames");
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Sender<Frame>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pull end of a session's frame stream
///
/// Frames handed out are `InUse`; release them (or drop them) to give the
/// buffer back. All waits end with `SessionClosed` once the session closes.
#[derive(Clone)]
pub struct FrameReceiver {
    frames: Receiver<Frame>,
    closed: Receiver<()>,
}

impl FrameReceiver {
    /// Oldest queued frame, waiting up to `timeout`
    pub fn next_frame(&self, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            self.ensure_open()?;
            let remaining =
                deadline.map_or(timeout, |deadline| deadline.saturating_duration_since(Instant::now()));
            let frame = Selector::new()
                .recv(&self.frames, |frame| frame.map_err(|_| CameraError::SessionClosed))
                .recv(&self.closed, |_| Err(CameraError::SessionClosed))
                .wait_timeout(remaining)
                .map_err(|_| CameraError::Timeout)??;
            if let Some(frame) = self.hand_over(frame)? {
                return Ok(frame);
            }
        }
    }

    /// Newest queued frame, discarding older ones; waits if none is queued
    pub fn latest_frame(&self, timeout: Duration) -> Result<Frame> {
        self.ensure_open()?;
        match self.frames.try_iter().filter(Frame::is_current).last() {
            Some(frame) => match self.hand_over(frame)? {
                Some(frame) => Ok(frame),
                None => self.next_frame(timeout),
            },
            None => self.next_frame(timeout),
        }
    }

    /// Discard everything queued and wait for a frame that arrives afterwards
    pub fn next_new_frame(&self, timeout: Duration) -> Result<Frame> {
        self.ensure_open()?;
        let discarded = self.frames.try_iter().count();
        if discarded > 0 {
            debug!(discarded, "Skipped queued frames");
        }
        self.next_frame(timeout)
    }

    /// Async variant of `next_frame` for tokio consumers
    pub async fn next_frame_async(&self, timeout: Duration) -> Result<Frame> {
        self.ensure_open()?;
        tokio::time::timeout(timeout, self.recv_current())
            .await
            .map_err(|_| CameraError::Timeout)?
    }

    async fn recv_current(&self) -> Result<Frame> {
        loop {
            let frame = tokio::select! {
                frame = self.frames.recv_async() => frame.map_err(|_| CameraError::SessionClosed)?,
                _ = self.closed.recv_async() => return Err(CameraError::SessionClosed),
            };
            if let Some(frame) = self.hand_over(frame)? {
                return Ok(frame);
            }
        }
    }

    /// Frames waiting in this receiver's queue
    pub fn pending(&self) -> usize {
        self.frames.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_disconnected()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(CameraError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// None for a frame whose buffer pool was replaced by a reconfiguration
    fn hand_over(&self, frame: Frame) -> Result<Option<Frame>> {
        self.ensure_open()?;
        if !frame.is_current() {
            debug!(sequence = frame.sequence(), "Skipping frame from a retired buffer pool");
            return Ok(None);
        }
        frame.claim();
        Ok(Some(frame))
    }
}

/// Gives free buffers back to the transport
pub(crate) trait Replenish: Send + Sync {
    fn requeue(&self, buffer: BufferLease) -> std::result::Result<(), TransportError>;
}

/// Receives what the dispatch loop reports upward
pub(crate) trait DispatchObserver: Send + Sync {
    fn dropped_frame(&self, sequence: u64);
    fn fault(&self, generation: u64, kind: FaultKind);
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DispatchSettings {
    pub heartbeat_timeout: Option<Duration>,
    pub starvation_grace: Duration,
    pub tick: Duration,
    pub cpu: Option<usize>,
}

/// Everything one dispatch thread needs for one stream
pub(crate) struct Dispatcher {
    pub device_id: String,
    pub generation: u64,
    pub events: Receiver<TransportEvent>,
    pub pool: BufferPool,
    pub sequences: SharedTracker,
    pub link: Arc<dyn Replenish>,
    pub outputs: Arc<Outputs>,
    pub stats: Arc<PipelineStats>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub clock: Arc<dyn Clock>,
    pub observer: Arc<dyn DispatchObserver>,
    pub settings: DispatchSettings,
}

/// Running dispatch thread
pub(crate) struct DispatchHandle {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DispatchHandle {
    /// Stop the loop and wait for it
    pub fn stop(mut self) {
        self.signal();
        self.join();
    }

    /// Ask the loop to stop without waiting
    pub fn signal(&mut self) {
        self.shutdown.take();
    }

    /// Wait for the loop to exit, unless called from the loop itself
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

enum Step {
    Event(TransportEvent),
    EventsClosed,
    Free(usize),
    Tick,
    Shutdown,
}

struct Watch {
    last_event: Instant,
    starved_since: Option<Instant>,
    faulted: bool,
}

impl Dispatcher {
    pub fn spawn(self) -> Result<DispatchHandle> {
        let (shutdown, stopped) = flume::bounded::<()>(0);
        let started = self.clock.now();
        let thread = thread::Builder::new()
            .name(format!("dispatch-{}", self.device_id))
            .spawn(move || self.run(stopped, started))
            .map_err(|e| {
                CameraError::ResourceExhausted(format!("cannot spawn dispatch thread: {e}"))
            })?;
        Ok(DispatchHandle {
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    fn run(self, stopped: Receiver<()>, started: Instant) {
        if let Some(cpu) = self.settings.cpu {
            crate::utils::pin_current_thread(cpu);
        }
        info!(
            device = %self.device_id,
            generation = self.generation,
            "Dispatch loop started"
        );

        let mut watch = Watch {
            last_event: started,
            starved_since: None,
            faulted: false,
        };
        let mut events_open = true;

        loop {
            let mut selector = Selector::new().recv(&stopped, |_| Step::Shutdown);
            if events_open {
                selector = selector.recv(&self.events, |event| {
                    event.map_or(Step::EventsClosed, Step::Event)
                });
            }
            if !watch.faulted {
                selector = selector.recv(self.pool.free_ids(), |id| id.map_or(Step::Tick, Step::Free));
            }

            match selector.wait_timeout(self.settings.tick).unwrap_or(Step::Tick) {
                Step::Shutdown => break,
                Step::EventsClosed => {
                    events_open = false;
                    let kind = FaultKind::Io("transport closed the stream".to_string());
                    self.raise(&mut watch, kind);
                }
                Step::Event(TransportEvent::Filled(buffer)) => {
                    watch.last_event = self.clock.now();
                    self.accept(buffer);
                }
                Step::Event(TransportEvent::Failed(message)) => {
                    watch.last_event = self.clock.now();
                    self.raise(&mut watch, FaultKind::Io(message));
                }
                Step::Free(id) => self.replenish(id, &mut watch),
                Step::Tick => {}
            }

            if let Some(kind) = self.check_watchdogs(&mut watch) {
                self.raise(&mut watch, kind);
            }
        }

        // Late buffers go straight back to the pool
        let late = self.events.drain().count();
        debug!(
            device = %self.device_id,
            generation = self.generation,
            late,
            last_sequence = ?lock_tracker(&self.sequences).last(),
            "Dispatch loop stopped"
        );
    }

    fn accept(&self, buffer: BufferLease) {
        self.stats.frame_received();
        let mut meta = match buffer.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                debug!("Discarding reclaimed buffer: {}", e);
                return;
            }
        };

        if !meta.valid {
            self.stats.incomplete_buffer();
            debug!(block_id = meta.block_id, "Incomplete buffer recycled");
            return;
        }

        let admission = lock_tracker(&self.sequences).admit(meta.block_id);
        meta.sequence = match admission {
            Admission::InOrder(sequence) => sequence,
            Admission::Gap { sequence, missing } => {
                self.stats.frames_dropped(missing.end - missing.start);
                for dropped in missing {
                    debug!(sequence = dropped, "Dropped frame");
                    self.observer.dropped_frame(dropped);
                }
                sequence
            }
            Admission::Discontinuity { sequence, skipped } => {
                self.stats.frames_dropped(skipped);
                warn!(
                    block_id = meta.block_id,
                    sequence, skipped, "Sequence discontinuity, resynchronised"
                );
                sequence
            }
            Admission::Stale => {
                self.stats.out_of_order();
                warn!(block_id = meta.block_id, "Out-of-order buffer discarded");
                return;
            }
        };

        let frame = Frame::new(buffer, meta, Arc::clone(&self.decoder), self.clock.now());
        if self.outputs.publish(frame) {
            self.stats.frame_delivered();
        }
    }

    fn replenish(&self, id: usize, watch: &mut Watch) {
        let buffer = match self.pool.lease_for_fill(id) {
            Ok(buffer) => buffer,
            Err(e) => {
                debug!(buffer = id, "Free buffer not requeued: {}", e);
                return;
            }
        };
        if let Err(e) = self.link.requeue(buffer) {
            self.raise(watch, FaultKind::Io(format!("buffer requeue failed: {e}")));
        }
    }

    fn check_watchdogs(&self, watch: &mut Watch) -> Option<FaultKind> {
        if watch.faulted {
            return None;
        }
        let now = self.clock.now();

        if let Some(limit) = self.settings.heartbeat_timeout {
            if now.duration_since(watch.last_event) >= limit {
                return Some(FaultKind::HeartbeatTimeout(limit));
            }
        }

        if self.pool.census().queued == 0 {
            let since = *watch.starved_since.get_or_insert(now);
            if now.duration_since(since) >= self.settings.starvation_grace {
                return Some(FaultKind::BufferStarvation(self.settings.starvation_grace));
            }
        } else {
            watch.starved_since = None;
        }
        None
    }

    /// Report the first fault of this stream; later ones are noise
    fn raise(&self, watch: &mut Watch, kind: FaultKind) {
        if std::mem::replace(&mut watch.faulted, true) {
            return;
        }
        warn!(
            device = %self.device_id,
            generation = self.generation,
            fault = %kind,
            "Stream fault"
        );
        self.stats.fault();
        self.observer.fault(self.generation, kind);
    }
}
