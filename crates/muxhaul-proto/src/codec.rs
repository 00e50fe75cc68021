//! Codec for length-prefixed signal strings
//!
//! Format: [length: u16 big-endian][payload: UTF-8 bytes]

use crate::signal::Signal;
use crate::{LENGTH_PREFIX_SIZE, MAX_SIGNAL_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Signal too long: {0} bytes")]
    TooLong(usize),

    #[error("Signal payload is not valid UTF-8")]
    InvalidUtf8,
}

impl CodecError {
    /// True when the peer went away (EOF or reset) rather than sending garbage
    pub fn is_disconnect(&self) -> bool {
        match self {
            CodecError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Signal frame codec
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalCodec;

impl SignalCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a single frame into a standalone buffer
    pub fn encode_frame(message: &str) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + message.len());
        write_frame(message, &mut buf)?;
        Ok(buf.freeze())
    }
}

fn write_frame(message: &str, dst: &mut BytesMut) -> Result<(), CodecError> {
    let payload = message.as_bytes();
    if payload.len() > MAX_SIGNAL_LEN {
        return Err(CodecError::TooLong(payload.len()));
    }

    dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
    dst.put_u16(payload.len() as u16);
    dst.extend_from_slice(payload);
    Ok(())
}

impl Decoder for SignalCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, CodecError> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < LENGTH_PREFIX_SIZE + length {
            src.reserve(LENGTH_PREFIX_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let payload = src.split_to(length);

        String::from_utf8(payload.to_vec())
            .map(Some)
            .map_err(|_| CodecError::InvalidUtf8)
    }
}

impl<'a> Encoder<&'a str> for SignalCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &'a str, dst: &mut BytesMut) -> Result<(), CodecError> {
        write_frame(item, dst)
    }
}

impl Encoder<Signal> for SignalCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Signal, dst: &mut BytesMut) -> Result<(), CodecError> {
        write_frame(item.as_str(), dst)
    }
}

/// Write one signal frame and flush it.
pub async fn send_signal<W>(writer: &mut W, message: &str) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = SignalCodec::encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one signal frame.
///
/// Reads only the bytes belonging to the frame, so the reader can be handed
/// to another consumer afterwards without losing data.
pub async fn receive_signal<R>(reader: &mut R) -> Result<String, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;

    let length = u16::from_be_bytes(prefix) as usize;
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    String::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)
}
