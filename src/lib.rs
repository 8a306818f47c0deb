mod compression;
pub use compression::{decompress, DecodeResult, DecoderState, DecompressError, FrameDecoder};

mod reconstruct;
pub use reconstruct::{reconstruct, unpremultiply, ReconstructError, BYTES_PER_PIXEL};

mod texture;
pub use texture::{
    ContainerLayout, LayoutError, Texture, TextureError, TextureHeader, TextureResult,
    TextureState,
};
