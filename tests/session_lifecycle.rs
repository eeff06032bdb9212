mod common;

use std::thread;
use std::time::Duration;

use common::*;
use cynlr_camera::transport::SimulatedTransport;
use cynlr_camera::{
    CameraError, CameraSystem, DeliveryMode, PixelFormat, SessionEvent, SessionOptions,
    SessionState, StreamConfiguration,
};

#[test]
fn test_full_lifecycle() {
    let (sim, _clock, system) = rig(SessionOptions::default());
    let device = system.find_device(CAMERA).unwrap();
    let session = system.session();
    let events = session.events();

    session.open(&device).unwrap();
    session.apply_configuration(small_config(4)).unwrap();
    assert_eq!(session.pool_census().unwrap().free, 4);

    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Streaming);
    assert!(sim.is_streaming(CAMERA));
    assert_eq!(sim.queued_buffers(CAMERA), 4);

    assert_eq!(sim.emit_frame(CAMERA), Some(0));
    let frame = session.next_frame(WAIT).unwrap();
    assert_eq!(frame.sequence(), 0);
    assert_eq!(frame.metadata().bytes_used, 16 * 8);
    assert_eq!(frame.metadata().format, PixelFormat::Mono8);
    assert_eq!(frame.read(|data| data[..4].to_vec()).unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(session.pool_census().unwrap().in_use, 1);
    frame.release().unwrap();

    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Configured);
    assert!(!sim.is_streaming(CAMERA));
    let census = session.pool_census().unwrap();
    assert_eq!(census.free, 4, "{census:?}");

    session.close().unwrap();
    assert!(!sim.is_open(CAMERA));
    assert!(!system.registry().is_checked_out(CAMERA));

    use SessionState::*;
    let seen: Vec<SessionEvent> = events.try_iter().collect();
    assert_eq!(
        seen,
        vec![
            SessionEvent::StateChanged { from: Disconnected, to: Connecting },
            SessionEvent::StateChanged { from: Connecting, to: Configured },
            SessionEvent::StateChanged { from: Configured, to: Streaming },
            SessionEvent::StateChanged { from: Streaming, to: Configured },
            SessionEvent::StateChanged { from: Configured, to: Closed },
            SessionEvent::Closed,
        ]
    );
}

#[test]
fn test_restart_after_stop() {
    let (sim, _clock, system) = rig(SessionOptions::default());
    let session = streaming_session(&system, 3);
    sim.emit_frame(CAMERA);
    session.next_frame(WAIT).unwrap().release().unwrap();
    session.stop().unwrap();

    // Block ids restart with the stream, the session sequence carries on
    let events = session.events();
    session.start().unwrap();
    assert_eq!(sim.emit_frame(CAMERA), Some(0));
    let frame = session.next_frame(WAIT).unwrap();
    assert_eq!(frame.sequence(), 1);
    assert_eq!(frame.block_id(), 0);
    assert!(!events
        .try_iter()
        .any(|event| matches!(event, SessionEvent::DroppedFrame { .. })));
}

#[test]
fn test_reconfigure_skips_frames_from_replaced_pool() {
    let (sim, _clock, system) = rig(SessionOptions::default());
    let session = streaming_session(&system, 3);
    sim.emit_frame(CAMERA);
    sim.emit_frame(CAMERA);
    assert!(wait_until(WAIT, || session.stats().frames_delivered == 2));
    session.stop().unwrap();

    // A different buffer count replaces the pool the queued frames live in
    session.apply_configuration(small_config(5)).unwrap();
    assert_eq!(session.pool_census().unwrap().free, 5);
    session.start().unwrap();
    sim.emit_frame(CAMERA);

    let frame = session.next_frame(WAIT).unwrap();
    assert_eq!(frame.sequence(), 2);
    assert!(frame.is_current());
    assert_eq!(session.state(), SessionState::Streaming);
}

#[test]
fn test_start_failure_keeps_configured() {
    let (sim, _clock, system) = rig(SessionOptions::default());
    let device = system.find_device(CAMERA).unwrap();
    let session = system.open_session(&device, small_config(4)).unwrap();

    sim.fail_next_start("acquisition start refused");
    match session.start() {
        Err(CameraError::StartFailed(msg)) => assert!(msg.contains("acquisition start refused")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Configured);
    assert_eq!(session.pool_census().unwrap().free, 4);
    assert_eq!(sim.queued_buffers(CAMERA), 0);

    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Streaming);
}

#[test]
fn test_device_busy_across_systems() {
    let sim = SimulatedTransport::new().with_camera(CAMERA);
    let first = CameraSystem::new(sim.clone());
    let second = CameraSystem::new(sim.clone());
    let device = first.find_device(CAMERA).unwrap();

    let _held = first.open_session(&device, small_config(2)).unwrap();
    let session = second.session();
    assert!(matches!(session.open(&device), Err(CameraError::DeviceBusy(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn test_rejected_configuration_is_verbatim() {
    let sim = SimulatedTransport::new()
        .with_camera(CAMERA)
        .with_supported_formats(&[PixelFormat::Mono8]);
    let system = CameraSystem::new(sim);
    let session = system.session();
    session.open(&system.find_device(CAMERA).unwrap()).unwrap();

    let config = StreamConfiguration {
        pixel_format: PixelFormat::Mono12,
        ..small_config(2)
    };
    match session.apply_configuration(config) {
        Err(CameraError::UnsupportedConfiguration(msg)) => {
            assert_eq!(msg, "PixelFormat Mono12 not available")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Connecting);
    assert!(session.pool_census().is_none());

    session.apply_configuration(small_config(2)).unwrap();
    assert_eq!(session.state(), SessionState::Configured);
}

#[test]
fn test_configuration_locked_while_streaming() {
    let (_sim, _clock, system) = rig(SessionOptions::default());
    let session = streaming_session(&system, 2);
    assert!(matches!(
        session.apply_configuration(small_config(2)),
        Err(CameraError::InvalidState {
            current: SessionState::Streaming,
            ..
        })
    ));
}

#[test]
fn test_gap_reports_each_missing_frame() {
    let (sim, _clock, system) = rig(SessionOptions::default());
    let session = streaming_session(&system, 4);
    let events = session.events();

    sim.emit_frame(CAMERA);
    sim.skip_frames(CAMERA, 3);
    assert_eq!(sim.emit_frame(CAMERA), Some(4));

    assert_eq!(session.next_frame(WAIT).unwrap().sequence(), 0);
    assert_eq!(session.next_frame(WAIT).unwrap().sequence(), 4);

    let dropped: Vec<u64> = events
        .try_iter()
        .filter_map(|event| match event {
            SessionEvent::DroppedFrame { sequence } => Some(sequence),
            _ => None,
        })
        .collect();
    assert_eq!(dropped, vec![1, 2, 3]);
    assert_eq!(session.stats().frames_dropped, 3);
    assert!(wait_until(WAIT, || session.stats().frames_delivered == 2));
}

#[test]
fn test_incomplete_buffer_is_recycled() {
    let (sim, _clock, system) = rig(SessionOptions::default());
    let session = streaming_session(&system, 3);
    let events = session.events();

    sim.emit_frame(CAMERA);
    sim.emit_incomplete_frame(CAMERA);
    sim.emit_frame(CAMERA);

    assert_eq!(session.next_frame(WAIT).unwrap().sequence(), 0);
    assert_eq!(session.next_frame(WAIT).unwrap().sequence(), 2);
    assert_eq!(session.stats().incomplete_buffers, 1);
    assert!(events
        .try_iter()
        .any(|event| event == SessionEvent::DroppedFrame { sequence: 1 }));
}

#[test]
fn test_close_reclaims_checked_out_frames() {
    let (sim, _clock, system) = rig(SessionOptions::default());
    let session = streaming_session(&system, 4);
    sim.emit_frame(CAMERA);
    sim.emit_frame(CAMERA);

    let first = session.next_frame(WAIT).unwrap();
    let second = session.next_frame(WAIT).unwrap();
    assert_eq!(session.pool_census().unwrap().in_use, 2);

    let waiter = {
        let frames = session.frames();
        thread::spawn(move || frames.next_frame(Duration::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(50));

    session.close().unwrap();
    assert!(matches!(waiter.join().unwrap(), Err(CameraError::SessionClosed)));

    let census = session.pool_census().unwrap();
    assert_eq!(census.free, 4, "{census:?}");
    assert!(!first.is_current());
    assert!(matches!(first.read(|data| data.len()), Err(CameraError::SessionClosed)));
    drop(second);
    assert_eq!(session.pool_census().unwrap().free, 4);

    assert!(matches!(
        session.next_frame(Duration::from_millis(10)),
        Err(CameraError::SessionClosed)
    ));
    assert!(matches!(
        session.start(),
        Err(CameraError::InvalidState {
            current: SessionState::Closed,
            ..
        })
    ));
}

#[test]
fn test_broadcast_shares_one_buffer() {
    let options = SessionOptions {
        delivery: DeliveryMode::Broadcast,
        ..Default::default()
    };
    let (sim, _clock, system) = rig(options);
    let device = system.find_device(CAMERA).unwrap();
    let session = system.open_session(&device, small_config(3)).unwrap();
    let left = session.frames();
    let right = session.frames();
    session.start().unwrap();

    sim.emit_frame(CAMERA);
    let a = left.next_frame(WAIT).unwrap();
    let b = right.next_frame(WAIT).unwrap();
    assert_eq!(a.buffer_id(), b.buffer_id());
    assert_eq!(session.pool_census().unwrap().in_use, 1);

    a.release().unwrap();
    assert_eq!(session.pool_census().unwrap().in_use, 1);
    b.release().unwrap();
    assert!(wait_until(WAIT, || {
        let census = session.pool_census().unwrap();
        census.in_use == 0 && census.ready == 0
    }));
}

#[test]
fn test_frame_callbacks_run_on_dispatch() {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    let (sim, _clock, system) = rig(SessionOptions::default());
    let session = streaming_session(&system, 3);
    let seen = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&seen);
    session.on_frame(move |frame| {
        counter.fetch_add(frame.sequence() + 1, Ordering::SeqCst);
    });

    sim.emit_frame(CAMERA);
    sim.emit_frame(CAMERA);
    session.next_frame(WAIT).unwrap();
    session.next_frame(WAIT).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1 + 2);
}

#[test]
fn test_latest_frame_skips_backlog() {
    let (sim, _clock, system) = rig(SessionOptions::default());
    let session = streaming_session(&system, 4);
    for _ in 0..3 {
        sim.emit_frame(CAMERA);
    }
    assert!(wait_until(WAIT, || session.stats().frames_delivered == 3));

    let latest = session.latest_frame(WAIT).unwrap();
    assert_eq!(latest.sequence(), 2);
    assert!(matches!(
        session.next_frame(Duration::from_millis(20)),
        Err(CameraError::Timeout)
    ));
}

#[test]
fn test_controls_reach_the_device() {
    let (sim, _clock, system) = rig(SessionOptions::default());
    let session = streaming_session(&system, 2);
    session.set_auto_exposure(false).unwrap();
    session.set_frame_rate(12.5).unwrap();
    session.enable_lens_power(true).unwrap();
    session.setup_lens_serial("Baud57600").unwrap();

    let written = sim.written_controls(CAMERA);
    assert_eq!(written.len(), 4);
    assert_eq!(written[0].feature_name(), "ExposureAuto");
}
