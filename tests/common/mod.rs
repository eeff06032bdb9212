#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cynlr_camera::clock::ManualClock;
use cynlr_camera::transport::SimulatedTransport;
use cynlr_camera::{
    CameraSystem, FaultEvent, Session, SessionOptions, SessionState, StreamConfiguration,
};

pub const CAMERA: &str = "cam-0";
pub const WAIT: Duration = Duration::from_secs(5);

pub fn small_config(buffers: u32) -> StreamConfiguration {
    StreamConfiguration {
        width: 16,
        height: 8,
        buffer_count: buffers,
        ..Default::default()
    }
}

/// Simulated camera with a manual clock, so watchdogs only fire on `advance`
pub fn rig(options: SessionOptions) -> (SimulatedTransport, ManualClock, CameraSystem) {
    let sim = SimulatedTransport::new().with_camera(CAMERA);
    let clock = ManualClock::new();
    let system = CameraSystem::new(sim.clone())
        .with_clock(clock.clone())
        .with_options(options);
    (sim, clock, system)
}

pub fn streaming_session(system: &CameraSystem, buffers: u32) -> Session {
    let device = system.find_device(CAMERA).unwrap();
    let session = system.open_session(&device, small_config(buffers)).unwrap();
    session.start().unwrap();
    session
}

/// Poll until `condition` holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn wait_for_state(session: &Session, state: SessionState) -> bool {
    wait_until(WAIT, || session.state() == state)
}

/// Record every fault event the session reports
pub fn record_faults(session: &Session) -> Arc<Mutex<Vec<FaultEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    session.on_fault(move |event| sink.lock().unwrap().push(event.clone()));
    log
}
