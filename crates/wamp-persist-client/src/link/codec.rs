use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::io::{Cursor, Read as _, Write as _};

use super::envelope::Envelope;

const FLAG_PLAIN: u8 = 0;
const FLAG_GZIP: u8 = 1;

/// Frame layout: 4-byte big-endian length, 1-byte compression flag, JSON body.
///
/// The length counts the flag byte and the body.
pub struct LinkCodec;

impl LinkCodec {
    const COMPRESSION_THRESHOLD: usize = 1024;
    const HEADER_LEN: usize = 4;
    pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

    pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let json_data = serde_json::to_vec(envelope)
            .map_err(|e| CodecError::SerializationError(e.to_string()))?;

        let (flag, data) = if json_data.len() > Self::COMPRESSION_THRESHOLD {
            (FLAG_GZIP, Self::compress(&json_data)?)
        } else {
            (FLAG_PLAIN, json_data)
        };

        let data_len = data.len() + 1;
        if data_len > Self::MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(data_len));
        }

        let mut frame = Vec::with_capacity(Self::HEADER_LEN + data_len);
        frame.extend_from_slice(&(data_len as u32).to_be_bytes());
        frame.push(flag);
        frame.extend_from_slice(&data);

        Ok(frame)
    }

    /// Decode one frame from the front of `buffer`.
    ///
    /// Returns the envelope and the number of bytes consumed, or `None` when
    /// the frame is still incomplete.
    pub fn decode(buffer: &[u8]) -> Result<Option<(Envelope, usize)>, CodecError> {
        let Some(header) = buffer.first_chunk::<4>() else {
            return Ok(None);
        };
        let data_len = u32::from_be_bytes(*header) as usize;

        if data_len == 0 {
            return Err(CodecError::InvalidFrame);
        }
        if data_len > Self::MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(data_len));
        }

        let frame_len = Self::HEADER_LEN + data_len;
        let Some(frame) = buffer.get(Self::HEADER_LEN..frame_len) else {
            return Ok(None);
        };
        let (flag, data) = frame.split_first().ok_or(CodecError::InvalidFrame)?;

        let json_data = match *flag {
            FLAG_PLAIN => data.to_vec(),
            FLAG_GZIP => Self::decompress(data)?,
            _ => return Err(CodecError::InvalidFrame),
        };

        let envelope = serde_json::from_slice(&json_data)
            .map_err(|e| CodecError::DeserializationError(e.to_string()))?;

        Ok(Some((envelope, frame_len)))
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| CodecError::CompressionError(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::CompressionError(e.to_string()))
    }

    /// Inflated bodies are held to the same limit as frames on the wire.
    fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let limit = Self::MAX_FRAME_LEN as u64 + 1;
        let mut decoder = GzDecoder::new(Cursor::new(data)).take(limit);
        let mut result = Vec::new();
        decoder
            .read_to_end(&mut result)
            .map_err(|e| CodecError::CompressionError(e.to_string()))?;

        if result.len() > Self::MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(result.len()));
        }
        Ok(result)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("Frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),

    #[error("Invalid frame format")]
    InvalidFrame,
}

/// Accumulates socket reads until whole frames are available
#[derive(Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete envelope, if any.
    pub fn try_decode(&mut self) -> Result<Option<Envelope>, CodecError> {
        match LinkCodec::decode(&self.buffer)? {
            Some((envelope, consumed)) => {
                self.buffer.drain(..consumed);
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
