use serde::Deserialize;
use std::{fs, io, path::Path, sync::LazyLock};
use thiserror::Error;

use super::TextureError;

static INBUILT_LAYOUT: LazyLock<ContainerLayout> = LazyLock::new(|| {
    ContainerLayout::parse(include_str!("exapunks_layout.toml"))
        .expect("Failed to parse inbuilt layout")
});

/// Where the header fields and the compressed payload live inside a texture container.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerLayout {
    pub name: String,
    #[serde(default = "default_extension")]
    pub extension: String,

    /// offset of the little-endian `u32` width
    pub width_offset: usize,
    /// offset of the little-endian `u32` height
    pub height_offset: usize,
    /// the payload runs from here to the end of the file
    pub payload_offset: usize,
}

fn default_extension() -> String {
    "tex".to_string()
}

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Failed to read layout file")]
    Read(#[from] io::Error),
    #[error("Failed to parse layout file")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureHeader {
    pub width: u32,
    pub height: u32,
}

impl Default for ContainerLayout {
    fn default() -> Self {
        INBUILT_LAYOUT.clone()
    }
}

impl ContainerLayout {
    pub fn parse(layout: &str) -> Result<Self, toml::de::Error> {
        toml::de::from_str(layout)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LayoutError> {
        let layout = fs::read_to_string(path)?;
        Ok(Self::parse(&layout)?)
    }

    pub fn is_texture_path(&self, path: &Path) -> bool {
        path.extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case(&self.extension))
    }

    /// The file name of `path` up to the first occurrence of the texture extension.
    pub fn texture_name(&self, path: &Path) -> String {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let suffix = format!(".{}", self.extension);
        match file_name.find(&suffix) {
            Some(end) => file_name[..end].to_string(),
            None => file_name,
        }
    }

    pub fn read_header(&self, data: &[u8]) -> Result<TextureHeader, TextureError> {
        Ok(TextureHeader {
            width: read_u32(data, self.width_offset, "width")?,
            height: read_u32(data, self.height_offset, "height")?,
        })
    }

    pub fn payload<'a>(&self, data: &'a [u8]) -> Result<&'a [u8], TextureError> {
        data.get(self.payload_offset..).ok_or_else(|| {
            TextureError::MalformedContainer(format!(
                "payload offset {:#x} is past the end of the {} byte file",
                self.payload_offset,
                data.len()
            ))
        })
    }
}

fn read_u32(data: &[u8], offset: usize, field: &str) -> Result<u32, TextureError> {
    offset
        .checked_add(4)
        .and_then(|end| data.get(offset..end))
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| {
            TextureError::MalformedContainer(format!(
                "{} at {:#x} is past the end of the {} byte file",
                field,
                offset,
                data.len()
            ))
        })
}
