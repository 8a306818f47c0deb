use image::RgbaImage;
use std::{
    fmt, fs, io,
    path::Path,
    sync::{mpsc, Arc, Mutex, PoisonError, RwLock},
    thread::JoinHandle,
};
use thiserror::Error;

use crate::{
    reconstruct, DecodeResult, DecoderState, DecompressError, FrameDecoder, ReconstructError,
};

mod layout;
pub use layout::{ContainerLayout, LayoutError, TextureHeader};

/// Result of decoding a [`Texture`]. `None` means the decode was cancelled.
pub type TextureResult = Result<Option<Arc<RgbaImage>>, TextureError>;

/// Callback of a decode request that arrived while another decode was running.
type Waiter = Box<dyn FnOnce(TextureResult) + Send>;

#[derive(Error, Debug)]
pub enum TextureError {
    #[error("Failed to read texture file")]
    Read(#[from] io::Error),
    #[error("Malformed texture container: {0}")]
    MalformedContainer(String),
    #[error("Failed to decompress texture data")]
    Decompress(#[from] DecompressError),
    #[error("Failed to reconstruct texture image")]
    Reconstruct(#[from] ReconstructError),
    #[error("Decoder thread stopped without a result")]
    WorkerLost,
}

impl TextureError {
    /// Copy handed to every caller waiting on the same decode.
    fn duplicate(&self) -> Self {
        match self {
            Self::Read(err) => Self::Read(io::Error::new(err.kind(), err.to_string())),
            Self::MalformedContainer(reason) => Self::MalformedContainer(reason.clone()),
            Self::Decompress(err) => Self::Decompress(err.clone()),
            Self::Reconstruct(err) => Self::Reconstruct(err.clone()),
            Self::WorkerLost => Self::WorkerLost,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TextureState {
    Decoding(FrameDecoder),
    Decoded(Arc<RgbaImage>),
}

/// A texture container whose payload is decoded on first use.
///
/// Clones share the decode state, so a texture can be decoded on one thread while another polls
/// its progress. Only one decode runs at a time; requests made meanwhile get its result.
#[derive(Clone)]
pub struct Texture {
    name: String,
    file_name: String,
    width: u32,
    height: u32,
    crc: u32,

    payload: Arc<[u8]>,
    state: Arc<RwLock<TextureState>>,

    /// `Some` while a decode is running, holding the requests waiting on it
    in_flight: Arc<Mutex<Option<Vec<Waiter>>>>,
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("file_name", &self.file_name)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("crc", &self.crc)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Texture {
    pub fn open<P: AsRef<Path>>(path: P, layout: &ContainerLayout) -> Result<Self, TextureError> {
        let path = path.as_ref();
        let data = fs::read(path)?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Self::load(layout.texture_name(path), file_name, &data, layout)
    }

    /// Loads a texture from container bytes. Its file name is `name` with the layout's extension.
    pub fn from_bytes(
        name: impl Into<String>,
        data: &[u8],
        layout: &ContainerLayout,
    ) -> Result<Self, TextureError> {
        let name = name.into();
        let file_name = format!("{}.{}", name, layout.extension);

        Self::load(name, file_name, data, layout)
    }

    fn load(
        name: String,
        file_name: String,
        data: &[u8],
        layout: &ContainerLayout,
    ) -> Result<Self, TextureError> {
        let header = layout.read_header(data)?;
        let payload: Arc<[u8]> = layout.payload(data)?.into();
        let crc = crc32fast::hash(&payload);

        let texture = Self {
            name,
            file_name,
            width: header.width,
            height: header.height,
            crc,
            state: Arc::new(RwLock::new(TextureState::Decoding(FrameDecoder::new(
                payload.clone(),
            )))),
            payload,
            in_flight: Arc::new(Mutex::new(None)),
        };

        log::debug!(
            "Loaded texture '{}' ({}x{}) with {} payload bytes and CRC: {:#010x}",
            texture.name,
            texture.width,
            texture.height,
            texture.payload.len(),
            texture.crc
        );

        Ok(texture)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// CRC32 of the compressed payload.
    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Window title style description, e.g. `wall.tex (64×64)`.
    pub fn title(&self) -> String {
        format!("{} ({}×{})", self.file_name, self.width, self.height)
    }

    pub fn state(&self) -> TextureState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_decoding(&self) -> bool {
        matches!(self.state(), TextureState::Decoding(_))
    }

    pub fn progress(&self) -> f64 {
        match self.state() {
            TextureState::Decoding(decoder) => decoder.progress(),
            TextureState::Decoded(_) => 1.0,
        }
    }

    pub fn cancel(&self) {
        if let TextureState::Decoding(decoder) = self.state() {
            decoder.cancel();
        }
    }

    /// Decodes the texture on the calling thread, or returns the image of an earlier decode.
    ///
    /// If another thread is decoding the texture already, this waits for its result.
    pub fn decode(&self) -> TextureResult {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let decoder = match self.state() {
            TextureState::Decoded(image) => return Ok(Some(image)),
            TextureState::Decoding(decoder) => decoder,
        };

        if let Some(waiters) = in_flight.as_mut() {
            let (result_tx, result_rx) = mpsc::channel();
            waiters.push(Box::new(move |result| {
                // the receiver is still waiting below
                let _ = result_tx.send(result);
            }));
            drop(in_flight);

            log::debug!("Waiting for the running decode of '{}'", self.name);
            return result_rx.recv().unwrap_or(Err(TextureError::WorkerLost));
        }

        *in_flight = Some(Vec::new());
        drop(in_flight);

        self.finish(decoder.run_sync())
    }

    /// Decodes the texture on a worker thread and calls `on_complete` from there.
    ///
    /// If the texture was already decoded `on_complete` runs right away. If a decode is running
    /// already, `on_complete` gets its result once it completes. Neither case spawns a worker.
    pub fn decode_async<F>(&self, on_complete: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(TextureResult) + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let decoder = match self.state() {
            TextureState::Decoded(image) => {
                drop(in_flight);
                on_complete(Ok(Some(image)));
                return None;
            }
            TextureState::Decoding(decoder) => decoder,
        };

        if let Some(waiters) = in_flight.as_mut() {
            log::debug!("Decode of '{}' is running already, waiting for it", self.name);
            waiters.push(Box::new(on_complete));
            return None;
        }

        *in_flight = Some(Vec::new());
        drop(in_flight);

        let texture = self.clone();
        Some(decoder.run_async(move |result| on_complete(texture.finish(result))))
    }

    /// Completes the running decode and hands its result to every request that waited on it.
    fn finish(&self, result: DecodeResult<'_>) -> TextureResult {
        let result = self.complete(result);

        let waiters = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();

        for waiter in waiters {
            waiter(match &result {
                Ok(image) => Ok(image.clone()),
                Err(err) => Err(err.duplicate()),
            });
        }

        result
    }

    fn complete(&self, result: DecodeResult<'_>) -> TextureResult {
        let Some(data) = result? else {
            log::info!("Decoding of '{}' was cancelled", self.name);
            self.reset();
            return Ok(None);
        };

        let image = Arc::new(reconstruct(data, self.width, self.height)?);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let TextureState::Decoded(existing) = &*state {
            return Ok(Some(existing.clone()));
        }

        log::debug!("Decoded texture '{}'", self.name);
        *state = TextureState::Decoded(image.clone());

        Ok(Some(image))
    }

    /// Binds a fresh decoder to the payload after a cancelled decode.
    fn reset(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let cancelled = matches!(
            &*state,
            TextureState::Decoding(decoder) if decoder.state() == DecoderState::Cancelled
        );

        if cancelled {
            *state = TextureState::Decoding(FrameDecoder::new(self.payload.clone()));
        }
    }
}
