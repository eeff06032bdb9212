//! cynlr-camera acquisition demo
//!
//! Usage: `cynlr-camera [config.toml] [snapshot.png]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use flume::{Receiver, TryRecvError};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cynlr_camera::transport::Transport;
use cynlr_camera::{utils, CameraError, CameraSystem, Config, FrameReceiver, VERSION};

const FRAME_WAIT: Duration = Duration::from_millis(100);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cynlr_camera=debug"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[cfg(feature = "v4l2")]
fn build_transport(_config: &Config) -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(cynlr_camera::transport::V4l2Transport::new()))
}

#[cfg(not(feature = "v4l2"))]
fn build_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    let id = config.camera.device.as_deref().unwrap_or("sim-0");
    Ok(Arc::new(
        cynlr_camera::transport::SimulatedTransport::new()
            .with_camera(id)
            .with_frame_interval(config.camera.stream.frame_interval()?),
    ))
}

/// Pull frames until asked to stop; optionally save the first one
fn consume(
    frames: FrameReceiver,
    stop: Receiver<()>,
    mut snapshot: Option<PathBuf>,
) -> Result<u64> {
    let mut consumed = 0;
    loop {
        if let Err(TryRecvError::Disconnected) = stop.try_recv() {
            break;
        }
        let frame = match frames.next_frame(FRAME_WAIT) {
            Ok(frame) => frame,
            Err(CameraError::Timeout) => continue,
            Err(CameraError::SessionClosed) => break,
            Err(e) => {
                warn!("Frame error: {}", e);
                continue;
            }
        };

        consumed += 1;
        if let Some(path) = snapshot.take() {
            match frame.image() {
                Ok(image) => {
                    image.save(&path)?;
                    info!("Snapshot of frame {} saved to {}", frame.sequence(), path.display());
                }
                Err(e) => error!("Snapshot failed: {}", e),
            }
        }
        if consumed % 100 == 0 {
            info!("Consumed {} frames (last sequence {})", consumed, frame.sequence());
        }
        if let Err(e) = frame.release() {
            warn!("Frame release failed: {}", e);
        }
    }
    Ok(consumed)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("cynlr-camera {} launching...", VERSION);

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let snapshot_path = args.next().map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    config.camera.stream.validate()?;

    let transport = build_transport(&config)?;
    let device = utils::select_device(transport.as_ref(), config.camera.device.as_deref())?;
    info!("Using capture device: {}", device);

    let system = CameraSystem::with_transport(transport).with_options(config.session_options());
    let session = system.open_session(&device, config.camera.stream.clone())?;
    session.on_fault(|event| warn!(?event, "Fault monitor"));
    session.start()?;

    // Consumer runs on a blocking thread; dropping `stop_tx` ends it
    let (stop_tx, stop_rx) = flume::bounded::<()>(1);
    let frames = session.frames();
    let consumer = tokio::task::spawn_blocking(move || consume(frames, stop_rx, snapshot_path));

    tokio::signal::ctrl_c().await?;
    info!("Stopping acquisition");
    drop(stop_tx);
    let consumed = consumer.await??;
    session.stop()?;

    let stats = session.stats();
    info!(
        consumed,
        received = stats.frames_received,
        delivered = stats.frames_delivered,
        dropped = stats.frames_dropped,
        incomplete = stats.incomplete_buffers,
        faults = stats.faults,
        reconnects = stats.reconnects,
        "Drop rate {:.3}%",
        stats.drop_rate() * 100.0
    );

    session.close()?;
    info!("cynlr-camera shutting down");
    Ok(())
}
