//! Exact-length frame I/O over any async byte stream.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::driver::protocol::frame::{Frame, FrameHeader, HEADER_SIZE, MAX_FRAME_BODY};

/// Read one frame: exactly 9 header bytes, then exactly `length` body bytes.
///
/// `read_exact` keeps reading across short reads; EOF before either part is
/// complete surfaces as `UnexpectedEof`.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = FrameHeader::decode(&header_buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if header.body_len() > MAX_FRAME_BODY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Frame body of {} bytes exceeds maximum of {}",
                header.body_len(),
                MAX_FRAME_BODY
            ),
        ));
    }

    let mut body = vec![0u8; header.body_len()];
    reader.read_exact(&mut body).await?;
    Frame::from_parts(header, Bytes::from(body))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write the header, then the body, then flush.
///
/// `write_all` turns a zero-length write into `WriteZero`, so a partially
/// written frame always surfaces as an error.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = frame.header().encode();
    writer.write_all(&header).await?;
    writer.write_all(frame.body()).await?;
    writer.flush().await
}
