//! Multipart JPEG stream on top of the blocking capture engine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CaptureEngine;
use crate::error::StreamError;
use crate::utils::lock;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Wrap one JPEG in its multipart framing.
pub fn frame_part(jpeg: &[u8]) -> Bytes {
    const HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut part = BytesMut::with_capacity(HEADER.len() + jpeg.len() + 2);
    part.extend_from_slice(HEADER);
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// Exclusive use of the engine for one stream.
///
/// Dropping the lease stops the engine, whichever way the stream ended.
struct CaptureLease {
    engine: Arc<Mutex<CaptureEngine>>,
    active: Arc<AtomicBool>,
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        let engine = self.engine.clone();
        let active = self.active.clone();
        let release = move || {
            lock(&engine).stop();
            active.store(false, Ordering::Release);
            debug!("Capture lease released");
        };

        // a capture may still hold the engine; don't block a runtime worker on it
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}

/// Hands out at most one frame stream at a time
pub struct FrameStreamer {
    engine: Arc<Mutex<CaptureEngine>>,
    active: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl FrameStreamer {
    pub fn new(engine: CaptureEngine, shutdown: CancellationToken) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            active: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Start a stream of multipart parts.
    ///
    /// The engine is started lazily on first poll and stopped exactly once
    /// when the stream ends, is dropped, or the shutdown token fires.
    pub fn activate(&self) -> Result<impl Stream<Item = Bytes> + Send + 'static, StreamError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StreamError::Busy);
        }

        let lease = CaptureLease {
            engine: self.engine.clone(),
            active: self.active.clone(),
        };
        let shutdown = self.shutdown.clone();

        Ok(stream! {
            let lease = lease;

            let engine = lease.engine.clone();
            match tokio::task::spawn_blocking(move || lock(&engine).start()).await {
                Ok(Ok(())) => info!("Frame stream started"),
                Ok(Err(e)) => {
                    warn!("Could not start capture: {e}");
                    return;
                }
                Err(e) => {
                    warn!("Capture start task failed: {e}");
                    return;
                }
            }

            let mut frames = 0u64;
            loop {
                let engine = lease.engine.clone();
                let frame = tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Shutting down frame stream");
                        break;
                    }
                    frame = tokio::task::spawn_blocking(move || lock(&engine).capture_one_frame()) => frame,
                };

                match frame {
                    Ok(Some(jpeg)) => {
                        frames += 1;
                        yield frame_part(&jpeg);
                    }
                    Ok(None) => {
                        info!("Capture exhausted after {frames} frames");
                        break;
                    }
                    Err(e) => {
                        warn!("Capture task failed: {e}");
                        break;
                    }
                }

                tokio::task::yield_now().await;
            }
            debug!(frames, "Frame stream finished");
        })
    }
}
