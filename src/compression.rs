use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle},
};

mod decompress;
use decompress::Decompressor;
pub use decompress::{decompress, DecompressError};

/// Result of running a [`FrameDecoder`]: the decoded bytes, `None` if the run was cancelled, or
/// the reason the frame could not be decoded.
pub type DecodeResult<'a> = Result<Option<&'a [u8]>, DecompressError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Running,
    Cancelled,
    Finished,
    Failed,
}

#[derive(Debug)]
struct Shared {
    input: Arc<[u8]>,

    /// read position of the last block boundary
    position: AtomicUsize,
    started: AtomicBool,
    /// cancellation was requested
    cancelled: AtomicBool,
    /// a run saw the request and stopped without an outcome
    stopped: AtomicBool,

    /// only set once the decoder reached `Finished` or `Failed`
    outcome: OnceLock<Result<Vec<u8>, DecompressError>>,
}

/// Decoder for a single compressed frame.
///
/// Cloning a `FrameDecoder` yields another handle to the same decode, so one thread can run it
/// while others poll [`FrameDecoder::progress`] or call [`FrameDecoder::cancel`].
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    shared: Arc<Shared>,
}

impl FrameDecoder {
    pub fn new(input: impl Into<Arc<[u8]>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                input: input.into(),
                position: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                outcome: OnceLock::new(),
            }),
        }
    }

    /// Length of the compressed frame.
    pub fn len(&self) -> usize {
        self.shared.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.input.is_empty()
    }

    /// Fraction of the compressed frame consumed so far.
    pub fn progress(&self) -> f64 {
        let total = self.shared.input.len();
        if total == 0 {
            return 1.0;
        }

        self.shared.position.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// Current state of the decode.
    ///
    /// A cancel request only turns into [`DecoderState::Cancelled`] once a run has stopped on it,
    /// so the state never leaves `Cancelled` again. Until then the decoder reads as `Running`.
    pub fn state(&self) -> DecoderState {
        match self.shared.outcome.get() {
            Some(Ok(_)) => DecoderState::Finished,
            Some(Err(_)) => DecoderState::Failed,
            None if self.shared.stopped.load(Ordering::SeqCst) => DecoderState::Cancelled,
            None => DecoderState::Running,
        }
    }

    /// Asks a running decode to stop at the next block boundary. Has no effect once finished, and
    /// a decode already inside its last block still finishes.
    pub fn cancel(&self) {
        if self.shared.outcome.get().is_none()
            && !self.shared.cancelled.swap(true, Ordering::SeqCst)
        {
            log::debug!("Cancelling frame decode at {:.1}%", self.progress() * 100.0);
        }
    }

    /// The decoded bytes, once the decoder has finished.
    pub fn output(&self) -> Option<&[u8]> {
        match self.shared.outcome.get() {
            Some(Ok(output)) => Some(output.as_slice()),
            _ => None,
        }
    }

    /// Decodes the frame on the calling thread.
    ///
    /// A decoder only decodes once: later calls return the stored outcome (`Ok(None)` after a
    /// cancelled run), and a call made while another thread is decoding fails with
    /// [`DecompressError::AlreadyRunning`].
    pub fn run_sync(&self) -> DecodeResult<'_> {
        let shared = &*self.shared;

        if let Some(outcome) = shared.outcome.get() {
            return Self::view(outcome);
        }
        if shared.started.swap(true, Ordering::SeqCst) {
            return match shared.outcome.get() {
                Some(outcome) => Self::view(outcome),
                None if shared.stopped.load(Ordering::SeqCst) => Ok(None),
                None => Err(DecompressError::AlreadyRunning),
            };
        }
        if shared.cancelled.load(Ordering::SeqCst) {
            log::debug!("Frame decode cancelled before it started");
            shared.stopped.store(true, Ordering::SeqCst);
            return Ok(None);
        }

        log::debug!("Decoding frame of {} bytes", shared.input.len());

        let result = Decompressor::new(&shared.input).decompress_with(|position| {
            shared.position.store(position, Ordering::Relaxed);

            if shared.cancelled.load(Ordering::SeqCst) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        let outcome = match result {
            Ok(None) => {
                shared.stopped.store(true, Ordering::SeqCst);
                log::debug!(
                    "Frame decode cancelled at {:#x}",
                    shared.position.load(Ordering::Relaxed)
                );
                return Ok(None);
            }
            Ok(Some(output)) => {
                shared.position.store(shared.input.len(), Ordering::Relaxed);
                log::debug!("Decoded frame into {} bytes", output.len());
                Ok(output)
            }
            Err(err) => {
                log::debug!("Frame decode failed: {}", err);
                Err(err)
            }
        };

        Self::view(shared.outcome.get_or_init(|| outcome))
    }

    /// Decodes the frame on a new worker thread and hands the result to `on_complete` from there.
    pub fn run_async<F>(&self, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(DecodeResult<'_>) + Send + 'static,
    {
        let decoder = self.clone();
        thread::spawn(move || on_complete(decoder.run_sync()))
    }

    fn view(outcome: &Result<Vec<u8>, DecompressError>) -> DecodeResult<'_> {
        match outcome {
            Ok(output) => Ok(Some(output.as_slice())),
            Err(err) => Err(err.clone()),
        }
    }
}
