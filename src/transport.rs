use crate::{
    error::{Error, Result},
    frame::{Frame, FrameHeader, FRAME_HEADER_LEN},
    types::*,
};
use bytes::{Bytes, BytesMut};
use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read side of the framed transport. Owned exclusively by the reader task.
pub struct FrameReader<R> {
    io: R,
    /// Our advertised SETTINGS_MAX_FRAME_SIZE; larger frames are rejected
    /// before the payload is read.
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, max_frame_size: u32) -> Self {
        Self { io, max_frame_size }
    }

    /// Reads one complete frame. `Transport` errors (including EOF) are
    /// fatal to the connection.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.io.read_exact(&mut header).await?;
        let header = FrameHeader::parse(&header);
        if header.length > self.max_frame_size {
            return Err(Error::framing(
                ErrorCode::FrameSizeError,
                "frame exceeds advertised max frame size",
            ));
        }
        let mut payload = vec![0u8; header.length as usize];
        self.io.read_exact(&mut payload).await?;
        let frame = Frame::parse(header, Bytes::from(payload))?;
        trace!("recv {:?}", frame);
        Ok(frame)
    }
}

/// Write side of the framed transport. Owned exclusively by the writer task,
/// which makes every `write_frames` group atomic on the wire.
pub struct FrameWriter<W> {
    io: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(DEFAULT_MAX_FRAME_SIZE as usize),
        }
    }

    /// Writes the client connection preface followed by our initial
    /// SETTINGS. Must happen exactly once, before any other frame.
    pub async fn write_preface(&mut self, settings: &Frame) -> Result<()> {
        self.buf.clear();
        self.buf.extend_from_slice(CONNECTION_PREFACE);
        settings.encode(&mut self.buf);
        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        trace!("sent connection preface and {:?}", settings);
        Ok(())
    }

    /// Writes a group of frames back to back, with no interleaving.
    pub async fn write_frames(&mut self, frames: &[Frame]) -> Result<()> {
        self.buf.clear();
        for frame in frames {
            trace!("send {:?}", frame);
            frame.encode(&mut self.buf);
        }
        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        self.io.shutdown().await.ok();
    }
}
