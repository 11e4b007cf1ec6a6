//! Frame I/O over WebSocket binary messages.

use futures_util::{Sink, SinkExt};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{DecodeError, EncodeError};
use crate::protocol::Frame;

/// Why a frame could not be written.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("socket closed: {0}")]
    Socket(String),
}

pub fn to_message(frame: &Frame) -> Result<Message, EncodeError> {
    Ok(Message::Binary(frame.encode()?.into()))
}

pub fn from_bytes(bytes: &[u8]) -> Result<Frame, DecodeError> {
    Frame::decode(bytes)
}

/// Write `frames` in order and flush; returns the bytes written.
pub async fn send_frames<S>(sink: &mut S, frames: &[Frame]) -> Result<usize, WriteError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut written = 0;
    for frame in frames {
        let message = to_message(frame)?;
        written += message.len();
        sink.feed(message)
            .await
            .map_err(|e| WriteError::Socket(e.to_string()))?;
    }
    if !frames.is_empty() {
        sink.flush()
            .await
            .map_err(|e| WriteError::Socket(e.to_string()))?;
    }
    Ok(written)
}
