use std::io;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use super::Status;
use crate::platform_socket::BoxedStream;

const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const FOREIGN_PEER_HINT: &str = "the peer does not speak the pluglink frame protocol";

/// Records exchanged on a call connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Frame {
    /// First frame of every connection, sent by the caller.
    Call { service: String, method: String },
    /// One encoded request or response message.
    Message(Vec<u8>),
    /// The caller has no more request messages.
    Close,
    /// Final frame sent by the callee.
    Status(Status),
}

/// Writing half of a call connection
pub(crate) struct FrameWriter {
    io: WriteHalf<BoxedStream>,
}

impl FrameWriter {
    pub(crate) fn new(io: WriteHalf<BoxedStream>) -> Self {
        Self { io }
    }

    /// Send one length-prefixed frame and flush it
    pub(crate) async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        let serialized = bincode::serialize(frame).map_err(invalid_data)?;
        if serialized.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Frame too large: {} bytes", serialized.len()),
            ));
        }
        let len = serialized.len() as u32;

        self.io.write_all(&len.to_le_bytes()).await?;
        self.io.write_all(&serialized).await?;
        self.io.flush().await
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}

/// Reading half of a call connection
pub(crate) struct FrameReader {
    io: ReadHalf<BoxedStream>,
}

impl FrameReader {
    pub(crate) fn new(io: ReadHalf<BoxedStream>) -> Self {
        Self { io }
    }

    /// Receive the next frame, or `None` once the peer has closed the
    /// connection.
    pub(crate) async fn recv(&mut self) -> io::Result<Option<Frame>> {
        let mut len_buf = [0u8; 4];
        match self.io.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame too large: {len} bytes ({FOREIGN_PEER_HINT})"),
            ));
        }

        let mut frame_buf = vec![0u8; len];
        self.io.read_exact(&mut frame_buf).await?;

        bincode::deserialize(&frame_buf).map(Some).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Undecodable frame: {e} ({FOREIGN_PEER_HINT})"),
            )
        })
    }
}

pub(crate) fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, Status> {
    bincode::serialize(message)
        .map_err(|e| Status::internal(format!("Failed to serialize message: {e}")))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Status> {
    bincode::deserialize(bytes)
        .map_err(|e| Status::invalid_argument(format!("Failed to deserialize message: {e}")))
}

fn invalid_data(err: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(all(test, unix))]
mod tests {
    use tokio::net::UnixStream;

    use super::*;

    fn pair() -> (FrameWriter, FrameReader) {
        let (a, b) = UnixStream::pair().expect("socket pair");
        let (_, write) = tokio::io::split(Box::new(a) as BoxedStream);
        let (read, _) = tokio::io::split(Box::new(b) as BoxedStream);
        (FrameWriter::new(write), FrameReader::new(read))
    }

    #[tokio::test]
    async fn frames_arrive_in_order_and_eof_is_none() {
        let (mut writer, mut reader) = pair();
        writer
            .send(&Frame::Call {
                service: "test.Echo".into(),
                method:  "Send".into(),
            })
            .await
            .expect("send call");
        writer.send(&Frame::Message(vec![1, 2, 3])).await.expect("send message");
        writer.shutdown().await.expect("shutdown");
        drop(writer);

        let Some(Frame::Call { service, method }) = reader.recv().await.expect("recv call") else {
            panic!("expected a call frame");
        };
        assert_eq!((service.as_str(), method.as_str()), ("test.Echo", "Send"));

        let Some(Frame::Message(bytes)) = reader.recv().await.expect("recv message") else {
            panic!("expected a message frame");
        };
        assert_eq!(bytes, vec![1, 2, 3]);
        assert!(reader.recv().await.expect("recv eof").is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (a, b) = UnixStream::pair().expect("socket pair");
        let mut raw = a;
        let too_big = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        raw.write_all(&too_big).await.expect("write prefix");

        let (read, _) = tokio::io::split(Box::new(b) as BoxedStream);
        let mut reader = FrameReader::new(read);
        let err = reader.recv().await.expect_err("frame should be rejected");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn http2_preface_is_reported_as_a_foreign_peer() {
        let (a, b) = UnixStream::pair().expect("socket pair");
        let mut raw = a;
        raw.write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n")
            .await
            .expect("write preface");

        let (read, _) = tokio::io::split(Box::new(b) as BoxedStream);
        let mut reader = FrameReader::new(read);
        let err = reader.recv().await.expect_err("preface is not a frame");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("pluglink frame protocol"));
    }
}
