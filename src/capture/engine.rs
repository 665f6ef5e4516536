//! Backend-agnostic capture engine

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use super::frame::StreamFormat;
use super::mmap::RawBufferBackend;
use super::v4l2::LibraryBackend;
use crate::error::CaptureError;
use crate::{BackendKind, CaptureConfig};

/// Outcome of one bounded dequeue attempt
#[derive(Debug)]
pub enum FrameRead {
    Frame(Bytes),
    TimedOut,
}

/// A capture device driver.
///
/// `read_frame` must return within roughly `wait`; the engine owns the policy
/// for what to do with repeated timeouts.
pub trait CaptureBackend: Send {
    fn name(&self) -> &'static str;

    fn stream_format(&self) -> StreamFormat;

    /// Enter streaming mode. May be called again after `stop`.
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Leave streaming mode and release buffers. Must tolerate being called
    /// when nothing was started.
    fn stop(&mut self);

    fn read_frame(&mut self, wait: Duration) -> Result<FrameRead, CaptureError>;
}

/// How long one dequeue may wait, and how many misses in a row end a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub wait: Duration,
    pub max_consecutive: u32,
}

impl TimeoutPolicy {
    pub fn new(wait: Duration, max_consecutive: u32) -> Self {
        Self {
            wait,
            max_consecutive: max_consecutive.max(1),
        }
    }

    /// Upper bound on how long `capture_one_frame` can block.
    pub fn budget(&self) -> Duration {
        self.wait * self.max_consecutive
    }
}

impl From<&CaptureConfig> for TimeoutPolicy {
    fn from(config: &CaptureConfig) -> Self {
        Self::new(
            Duration::from_millis(config.dequeue_timeout_ms),
            config.max_consecutive_timeouts,
        )
    }
}

pub struct CaptureEngine {
    backend: Box<dyn CaptureBackend>,
    policy: TimeoutPolicy,
    streaming: bool,
}

impl CaptureEngine {
    /// Open `device` with the backend selected in `config`.
    pub fn open(device: &Path, config: &CaptureConfig) -> Result<Self, CaptureError> {
        let backend: Box<dyn CaptureBackend> = match config.backend {
            BackendKind::Library => Box::new(LibraryBackend::open(device, config)?),
            BackendKind::RawBuffer => Box::new(RawBufferBackend::open(device, config)?),
        };
        info!(
            backend = backend.name(),
            format = ?backend.stream_format(),
            "Capture engine ready on {}",
            device.display()
        );
        Ok(Self::with_backend(backend, TimeoutPolicy::from(config)))
    }

    pub fn with_backend(backend: Box<dyn CaptureBackend>, policy: TimeoutPolicy) -> Self {
        Self {
            backend,
            policy,
            streaming: false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn stream_format(&self) -> StreamFormat {
        self.backend.stream_format()
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.streaming {
            return Ok(());
        }
        if let Err(e) = self.backend.start() {
            // leave no half-built buffer pool behind
            self.backend.stop();
            return Err(e);
        }
        self.streaming = true;
        debug!(backend = self.backend.name(), "Streaming started");
        Ok(())
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        if !self.streaming {
            return;
        }
        self.backend.stop();
        self.streaming = false;
        debug!(backend = self.backend.name(), "Streaming stopped");
    }

    /// One JPEG frame, or `None` when the stream is over.
    ///
    /// Blocks for at most `policy.budget()` plus the time spent converting
    /// frames that failed transiently.
    #[instrument(skip(self), level = "trace")]
    pub fn capture_one_frame(&mut self) -> Option<Bytes> {
        if !self.streaming {
            return None;
        }

        let mut misses = 0u32;
        loop {
            match self.backend.read_frame(self.policy.wait) {
                Ok(FrameRead::Frame(jpeg)) => {
                    metrics::counter!("frames_captured").increment(1);
                    return Some(jpeg);
                }
                Ok(FrameRead::TimedOut) => {
                    misses += 1;
                    metrics::counter!("capture_timeouts").increment(1);
                    warn!(
                        misses,
                        limit = self.policy.max_consecutive,
                        "No frame within {:?}",
                        self.policy.wait
                    );
                }
                Err(e) if e.is_transient() => {
                    misses += 1;
                    warn!(misses, "Dropping frame: {e}");
                }
                Err(e) => {
                    warn!("Capture stream ended: {e}");
                    return None;
                }
            }

            if misses >= self.policy.max_consecutive {
                warn!("Giving up after {misses} consecutive failed reads");
                return None;
            }
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::capture::frame::{FrameGeometry, PixelFormat};

    pub(crate) enum Step {
        Frame(&'static [u8]),
        Timeout,
        Fail(CaptureError),
    }

    /// Scripted backend; an empty script keeps timing out.
    pub(crate) struct ScriptedBackend {
        pub script: VecDeque<Step>,
        pub fail_start: bool,
        pub starts: Arc<AtomicUsize>,
        pub stops: Arc<AtomicUsize>,
    }

    impl ScriptedBackend {
        pub fn new(script: impl IntoIterator<Item = Step>) -> Self {
            Self {
                script: script.into_iter().collect(),
                fail_start: false,
                starts: Arc::default(),
                stops: Arc::default(),
            }
        }
    }

    impl CaptureBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn stream_format(&self) -> StreamFormat {
            StreamFormat {
                format: PixelFormat::Mjpeg,
                geometry: FrameGeometry::new(2, 2, 0, PixelFormat::Mjpeg),
            }
        }

        fn start(&mut self) -> Result<(), CaptureError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(CaptureError::NoBuffers);
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn read_frame(&mut self, wait: Duration) -> Result<FrameRead, CaptureError> {
            match self.script.pop_front() {
                Some(Step::Frame(data)) => Ok(FrameRead::Frame(Bytes::from_static(data))),
                Some(Step::Fail(e)) => Err(e),
                Some(Step::Timeout) | None => {
                    std::thread::sleep(wait);
                    Ok(FrameRead::TimedOut)
                }
            }
        }
    }

    fn scripted_engine(backend: ScriptedBackend, max: u32) -> CaptureEngine {
        CaptureEngine::with_backend(
            Box::new(backend),
            TimeoutPolicy::new(Duration::from_millis(5), max),
        )
    }

    #[test]
    fn test_frames_survive_isolated_timeouts() {
        let mut engine = scripted_engine(
            ScriptedBackend::new([Step::Timeout, Step::Frame(b"one"), Step::Timeout, Step::Frame(b"two")]),
            3,
        );
        engine.start().unwrap();
        assert_eq!(engine.capture_one_frame().as_deref(), Some(&b"one"[..]));
        assert_eq!(engine.capture_one_frame().as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn test_consecutive_timeouts_end_the_stream_within_budget() {
        let mut engine = scripted_engine(ScriptedBackend::new([]), 4);
        engine.start().unwrap();

        let started = Instant::now();
        assert!(engine.capture_one_frame().is_none());
        let budget = engine.policy().budget();
        assert!(started.elapsed() < budget + Duration::from_millis(200));
    }

    #[test]
    fn test_fatal_error_ends_stream_immediately() {
        let mut engine = scripted_engine(
            ScriptedBackend::new([Step::Fail(CaptureError::NotStreaming), Step::Frame(b"late")]),
            8,
        );
        engine.start().unwrap();
        assert!(engine.capture_one_frame().is_none());
    }

    #[test]
    fn test_transient_errors_count_as_misses() {
        let short = || Step::Fail(CaptureError::ShortFrame { expected: 8, got: 1 });
        let mut engine = scripted_engine(ScriptedBackend::new([short(), short(), Step::Frame(b"ok")]), 3);
        engine.start().unwrap();
        assert_eq!(engine.capture_one_frame().as_deref(), Some(&b"ok"[..]));

        let mut engine = scripted_engine(ScriptedBackend::new([short(), short(), Step::Frame(b"ok")]), 2);
        engine.start().unwrap();
        assert!(engine.capture_one_frame().is_none());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let backend = ScriptedBackend::new([]);
        let stops = backend.stops.clone();
        let mut engine = scripted_engine(backend, 1);

        engine.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 0);

        engine.start().unwrap();
        engine.stop();
        engine.stop();
        drop(engine);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_start_releases_backend() {
        let mut backend = ScriptedBackend::new([]);
        backend.fail_start = true;
        let stops = backend.stops.clone();
        let mut engine = scripted_engine(backend, 1);

        assert!(engine.start().is_err());
        assert!(!engine.is_streaming());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(engine.capture_one_frame().is_none());
    }

    #[test]
    fn test_policy_never_allows_zero_attempts() {
        let policy = TimeoutPolicy::new(Duration::from_millis(100), 0);
        assert_eq!(policy.max_consecutive, 1);
        assert_eq!(policy.budget(), Duration::from_millis(100));
    }
}
