use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    Frame, FrameCodec, FrameError, FrameHeader, HEADER_LEN, Request, ResponseMessage,
};

/// Read one frame off `reader`. Returns `None` when the peer closed the stream
/// cleanly between two frames.
pub async fn read_frame<R>(reader: &mut R, codec: &FrameCodec) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut raw[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                expected: HEADER_LEN,
                found: filled,
            });
        }
        filled += n;
    }

    let header = FrameHeader::parse(&raw)?;
    codec.check_length(&header)?;
    let mut body = BytesMut::zeroed(header.length as usize);
    reader.read_exact(&mut body).await?;
    codec.decode(header, body.freeze()).map(Some)
}

/// Encode a request into a complete frame.
pub fn encode_request(
    codec: &FrameCodec,
    stream: i16,
    request: &Request,
    flags: u8,
) -> Result<Bytes, FrameError> {
    let mut body = BytesMut::new();
    request.encode_body(&mut body);
    codec.encode_request(stream, request.opcode(), flags, &body)
}

/// Encode a response into a complete frame.
pub fn encode_response(
    codec: &FrameCodec,
    stream: i16,
    message: &ResponseMessage,
) -> Result<Bytes, FrameError> {
    let mut body = BytesMut::new();
    let flags = message.encode(&mut body);
    codec.encode_response(stream, message.response.opcode(), flags, &body)
}

/// Sequential, one-frame-at-a-time view of a transport. Used while a connection
/// is still being negotiated; afterwards the stream is split between a reader and
/// a writer task.
pub struct ProtocolTransport<T> {
    stream: T,
    codec: FrameCodec,
}

impl<T: AsyncRead + AsyncWrite + Unpin> ProtocolTransport<T> {
    pub fn new(stream: T, codec: FrameCodec) -> Self {
        Self { stream, codec }
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Switch codecs, e.g. once compression has been agreed on.
    pub fn set_codec(&mut self, codec: FrameCodec) {
        self.codec = codec;
    }

    pub async fn write_request(&mut self, stream: i16, request: &Request) -> Result<(), FrameError> {
        let raw = encode_request(&self.codec, stream, request, 0)?;
        self.stream.write_all(&raw).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_response(
        &mut self,
        stream: i16,
        message: &ResponseMessage,
    ) -> Result<(), FrameError> {
        let raw = encode_response(&self.codec, stream, message)?;
        self.stream.write_all(&raw).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        read_frame(&mut self.stream, &self.codec).await
    }

    pub async fn read_response(&mut self) -> Result<(i16, ResponseMessage), FrameError> {
        let frame = self
            .read_frame()
            .await?
            .ok_or_else(|| FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()))?;
        Ok((frame.stream(), ResponseMessage::decode(frame)?))
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}
