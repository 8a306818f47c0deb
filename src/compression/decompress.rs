use std::ops::ControlFlow;
use thiserror::Error;

/// Nibble value that signals an LSIC-extended length.
const EXTENDED_LENGTH: u8 = 0x0f;
/// Matches shorter than this are never encoded.
const MIN_MATCH: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecompressError {
    #[error("Stream ended at {position:#x} while reading {needed} more bytes")]
    UnexpectedEnd { position: usize, needed: usize },
    #[error("Back-reference offset {offset} is invalid with {available} bytes decoded")]
    InvalidOffset { offset: usize, available: usize },
    #[error("Length at {position:#x} does not fit in memory")]
    LengthOverflow { position: usize },
    #[error("Decoder is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Continue,
    Finished,
}

#[derive(Debug, Clone)]
pub(crate) struct Decompressor<'a> {
    src: &'a [u8],
    dst: Vec<u8>,

    /// index to read from
    read_index: usize,
}

impl<'a> Decompressor<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            // the output is at least as large as the input for any sane texture
            dst: Vec::with_capacity(src.len()),
            read_index: 0,
        }
    }

    /// Decodes blocks until the frame is exhausted.
    ///
    /// `between_blocks` receives the read position before every block and may stop decoding by
    /// returning [`ControlFlow::Break`], in which case the partial output is dropped and `None`
    /// is returned.
    pub fn decompress_with<F>(
        mut self,
        mut between_blocks: F,
    ) -> Result<Option<Vec<u8>>, DecompressError>
    where
        F: FnMut(usize) -> ControlFlow<()>,
    {
        loop {
            if between_blocks(self.read_index).is_break() {
                return Ok(None);
            }

            if self.src.is_empty() {
                return Ok(Some(self.dst));
            }

            if self.read_block()? == Block::Finished {
                return Ok(Some(self.dst));
            }
        }
    }

    fn read_block(&mut self) -> Result<Block, DecompressError> {
        let token = self.read()?;

        let literal_length = self.read_length(token >> 4)?;
        self.copy_literal(literal_length)?;

        // the last block of a frame carries literals only
        if self.read_index == self.src.len() {
            return Ok(Block::Finished);
        }

        let offset = self.read_offset()?;
        let match_length = self.read_length(token & 0x0f)?;
        let match_length = self.add_length(match_length, MIN_MATCH)?;

        log::trace!(
            "block at {:#x}: {} literals, copy {} from {} back",
            self.read_index,
            literal_length,
            match_length,
            offset
        );

        self.copy_backread(offset, match_length)?;

        Ok(Block::Continue)
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], DecompressError> {
        let src: &'a [u8] = self.src;
        let end = self
            .read_index
            .checked_add(count)
            .filter(|&end| end <= src.len())
            .ok_or(DecompressError::UnexpectedEnd {
                position: self.read_index,
                needed: count,
            })?;

        let bytes = &src[self.read_index..end];
        self.read_index = end;

        Ok(bytes)
    }

    fn read(&mut self) -> Result<u8, DecompressError> {
        Ok(self.take(1)?[0])
    }

    fn read_offset(&mut self) -> Result<usize, DecompressError> {
        let bytes = self.take(2)?;
        Ok(usize::from(u16::from_le_bytes([bytes[0], bytes[1]])))
    }

    /// Reads the remainder of an LSIC encoded length whose first nibble is `code`.
    fn read_length(&mut self, code: u8) -> Result<usize, DecompressError> {
        let mut length = usize::from(code);
        if code != EXTENDED_LENGTH {
            return Ok(length);
        }

        loop {
            let next = self.read()?;
            length = self.add_length(length, usize::from(next))?;

            if next != u8::MAX {
                return Ok(length);
            }
        }
    }

    fn add_length(&self, length: usize, extra: usize) -> Result<usize, DecompressError> {
        length
            .checked_add(extra)
            .ok_or(DecompressError::LengthOverflow {
                position: self.read_index,
            })
    }

    fn copy_literal(&mut self, count: usize) -> Result<(), DecompressError> {
        let literal = self.take(count)?;
        self.dst.extend_from_slice(literal);

        Ok(())
    }

    fn copy_backread(&mut self, offset: usize, count: usize) -> Result<(), DecompressError> {
        let available = self.dst.len();
        if offset == 0 || offset > available {
            return Err(DecompressError::InvalidOffset { offset, available });
        }

        let start = available - offset;

        if offset >= count {
            self.dst.extend_from_within(start..start + count);
        } else {
            // the source runs into the bytes written by this very copy
            for index in start..start + count {
                let value = self.dst[index];
                self.dst.push(value);
            }
        }

        Ok(())
    }
}

/// Decompresses a whole frame on the calling thread.
pub fn decompress(src: &[u8]) -> Result<Vec<u8>, DecompressError> {
    Decompressor::new(src)
        .decompress_with(|_| ControlFlow::Continue(()))
        .map(Option::unwrap_or_default)
}
