use super::*;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix plus command byte.
const HEADER_LEN: usize = 5;

/// One protocol message as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: u8, payload: impl Into<Bytes>) -> Self {
        Frame {
            command,
            payload: payload.into(),
        }
    }

    /// Serialises the frame, refusing payloads above `max_payload`.
    pub fn encode(&self, max_payload: usize) -> Result<Bytes, MilterError> {
        encode_frame(self.command, &self.payload, max_payload)
    }
}

fn encode_frame(command: u8, payload: &[u8], max_payload: usize) -> Result<Bytes, MilterError> {
    if payload.len() > max_payload {
        return Err(MilterError::FrameTooLarge {
            size: payload.len(),
            limit: max_payload,
        });
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32 + 1);
    buf.put_u8(command);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Writes a single frame. Nothing reaches the socket when the payload is
/// over the limit.
pub async fn write_frame<W>(
    writer: &mut W,
    command: u8,
    payload: &[u8],
    max_payload: usize,
    deadline: Deadline,
) -> Result<(), MilterError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let buf = encode_frame(command, payload, max_payload)?;
    deadline
        .run(async {
            writer.write_all(&buf).await?;
            writer.flush().await
        })
        .await
}

/// Reads a single frame.
pub async fn read_frame<R>(
    reader: &mut R,
    max_payload: usize,
    deadline: Deadline,
) -> Result<Frame, MilterError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    deadline
        .run(async {
            let mut header = [0u8; HEADER_LEN];
            reader.read_exact(&mut header).await.map_err(short_read)?;

            let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            if length == 0 {
                return Err(MilterError::InvalidLength(length));
            }
            let size = (length - 1) as usize;
            if size > max_payload {
                return Err(MilterError::FrameTooLarge {
                    size,
                    limit: max_payload,
                });
            }

            let mut payload = BytesMut::zeroed(size);
            reader.read_exact(&mut payload).await.map_err(short_read)?;
            Ok(Frame {
                command: header[4],
                payload: payload.freeze(),
            })
        })
        .await
}

fn short_read(e: std::io::Error) -> MilterError {
    if e.kind() == ErrorKind::UnexpectedEof {
        MilterError::ProtocolViolation("connection closed mid-frame".to_string())
    } else {
        MilterError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(TimeoutClass::Read, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_frame_layout() {
        let mut out = Vec::new();
        write_frame(&mut out, b'H', b"mx.example.org\0", MAX_CHUNK_SIZE, deadline())
            .await
            .unwrap();
        assert_eq!(&out[..4], &16u32.to_be_bytes());
        assert_eq!(out[4], b'H');
        assert_eq!(&out[5..], b"mx.example.org\0");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let payloads: [&[u8]; 3] = [b"", b"\0\0\r\n", &[0xffu8; 300]];
        for payload in payloads {
            let mut wire = Vec::new();
            write_frame(&mut wire, b'b', payload, MAX_CHUNK_SIZE, deadline())
                .await
                .unwrap();
            let frame = read_frame(&mut wire.as_slice(), MAX_CHUNK_SIZE, deadline())
                .await
                .unwrap();
            assert_eq!(frame, Frame::new(b'b', payload.to_vec()));
        }
    }

    #[tokio::test]
    async fn test_payload_at_limit() {
        let payload = vec![b'x'; 64];
        let mut wire = Vec::new();
        write_frame(&mut wire, b'B', &payload, 64, deadline())
            .await
            .unwrap();
        let frame = read_frame(&mut wire.as_slice(), 64, deadline())
            .await
            .unwrap();
        assert_eq!(frame.payload.len(), 64);

        let mut untouched = Vec::new();
        let result = write_frame(&mut untouched, b'B', &[0u8; 65], 64, deadline()).await;
        assert!(matches!(
            result,
            Err(MilterError::FrameTooLarge { size: 65, limit: 64 })
        ));
        assert!(untouched.is_empty());
    }

    #[tokio::test]
    async fn test_zero_length_rejected() {
        let wire = [0u8, 0, 0, 0, b'c'];
        let result = read_frame(&mut &wire[..], MAX_CHUNK_SIZE, deadline()).await;
        assert!(matches!(result, Err(MilterError::InvalidLength(0))));
    }

    #[tokio::test]
    async fn test_oversized_incoming_frame() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&1000u32.to_be_bytes());
        wire.push(b'b');
        let result = read_frame(&mut wire.as_slice(), 100, deadline()).await;
        assert!(matches!(result, Err(MilterError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_short_read_is_protocol_violation() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&10u32.to_be_bytes());
        wire.push(b'h');
        wire.extend_from_slice(b"abc");
        let result = read_frame(&mut wire.as_slice(), MAX_CHUNK_SIZE, deadline()).await;
        assert!(matches!(result, Err(MilterError::ProtocolViolation(_))));

        let result = read_frame(&mut &b"\0\0"[..], MAX_CHUNK_SIZE, deadline()).await;
        assert!(matches!(result, Err(MilterError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let (mut client, _server) = tokio::io::duplex(64);
        let deadline = Deadline::after(TimeoutClass::Read, Duration::from_millis(30));
        let result = read_frame(&mut client, MAX_CHUNK_SIZE, deadline).await;
        assert!(matches!(
            result,
            Err(MilterError::Timeout(TimeoutClass::Read))
        ));
    }
}
