mod common;

use std::time::Duration;

use common::*;
use cynlr_camera::{CameraError, SessionOptions};

#[tokio::test]
async fn test_next_frame_async() {
    let (sim, _clock, system) = rig(SessionOptions::default());
    let session = streaming_session(&system, 3);
    let frames = session.frames();

    sim.emit_frame(CAMERA);
    let frame = frames.next_frame_async(WAIT).await.unwrap();
    assert_eq!(frame.sequence(), 0);
    frame.release().unwrap();

    assert!(matches!(
        frames.next_frame_async(Duration::from_millis(20)).await,
        Err(CameraError::Timeout)
    ));
}

#[tokio::test]
async fn test_close_wakes_async_waiters() {
    let (_sim, _clock, system) = rig(SessionOptions::default());
    let session = streaming_session(&system, 3);
    let frames = session.frames();

    let waiter = tokio::spawn(async move { frames.next_frame_async(Duration::from_secs(10)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    session.close().unwrap();

    assert!(matches!(waiter.await.unwrap(), Err(CameraError::SessionClosed)));
}
