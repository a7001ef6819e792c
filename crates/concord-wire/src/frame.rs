//! Length-prefixed framing.
//!
//! Frame format on the wire:
//!
//! ```text
//! | length: u32 little-endian | payload: `length` bytes |
//! ```
//!
//! Zero-length frames and frames above the configured maximum are rejected.
//! Every read and write is bounded by an idle timeout; expiry, short reads,
//! and oversized headers are all fatal for the connection.

use crate::error::WireError;
use concord_types::config::{WireConfig, DEFAULT_IO_TIMEOUT_SECS, MAX_MESSAGE_SIZE};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Size of the length header preceding every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size and time bounds applied to each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_message_size: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            read_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
        }
    }
}

impl From<&WireConfig> for FrameLimits {
    fn from(config: &WireConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// Encode a payload length into its 4-byte header.
pub fn encode_length(len: u32) -> [u8; LENGTH_PREFIX_SIZE] {
    len.to_le_bytes()
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; LENGTH_PREFIX_SIZE]) -> u32 {
    u32::from_le_bytes(*header)
}

/// Write one frame: length header followed by the payload.
///
/// Only the connection's writer task calls this, so the header and payload
/// can never interleave with another frame.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    limits: &FrameLimits,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() as u64 > u64::from(limits.max_message_size) {
        return Err(WireError::MessageTooLarge {
            size: payload.len() as u64,
            max: limits.max_message_size,
        });
    }
    if payload.is_empty() {
        return Err(WireError::EmptyMessage);
    }

    let header = encode_length(payload.len() as u32);
    let write = async {
        writer.write_all(&header).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    };
    match timeout(limits.write_timeout, write).await {
        Ok(result) => result.map_err(WireError::from),
        Err(_) => Err(WireError::Timeout {
            operation: "write",
            after: limits.write_timeout,
        }),
    }
}

/// Read one frame and return its payload.
///
/// EOF before any header byte yields [`WireError::ConnectionClosed`]; EOF
/// anywhere later is an I/O error.
pub async fn read_frame<R>(reader: &mut R, limits: &FrameLimits) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let read_header = async {
        let mut header = [0u8; LENGTH_PREFIX_SIZE];
        // EOF before the first byte is a clean close; after it, a truncation.
        if reader.read(&mut header[..1]).await? == 0 {
            return Err(WireError::ConnectionClosed);
        }
        reader.read_exact(&mut header[1..]).await?;
        Ok::<_, WireError>(header)
    };
    let header = match timeout(limits.read_timeout, read_header).await {
        Ok(header) => header?,
        Err(_) => {
            return Err(WireError::Timeout {
                operation: "read",
                after: limits.read_timeout,
            })
        }
    };

    let len = decode_length(&header);
    if len > limits.max_message_size {
        return Err(WireError::MessageTooLarge {
            size: u64::from(len),
            max: limits.max_message_size,
        });
    }
    if len == 0 {
        return Err(WireError::EmptyMessage);
    }

    let mut body = vec![0u8; len as usize];
    match timeout(limits.read_timeout, reader.read_exact(&mut body)).await {
        Ok(Ok(_)) => Ok(body),
        Ok(Err(e)) => Err(WireError::Io(e)),
        Err(_) => Err(WireError::Timeout {
            operation: "read",
            after: limits.read_timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_limits() -> FrameLimits {
        FrameLimits {
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(100),
            ..FrameLimits::default()
        }
    }

    #[test]
    fn test_length_is_little_endian() {
        assert_eq!(encode_length(1), [1, 0, 0, 0]);
        assert_eq!(decode_length(&[0x00, 0x01, 0x00, 0x00]), 256);
        assert_eq!(decode_length(&encode_length(MAX_MESSAGE_SIZE)), MAX_MESSAGE_SIZE);
    }

    #[tokio::test]
    async fn test_roundtrip_assorted_sizes() {
        let limits = FrameLimits::default();
        for size in [1usize, 2, 255, 4096, 65_537] {
            let (mut a, mut b) = tokio::io::duplex(1024);
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let expected = payload.clone();
            let writer = tokio::spawn(async move {
                write_frame(&mut a, &payload, &limits).await.unwrap();
            });
            let got = read_frame(&mut b, &limits).await.unwrap();
            writer.await.unwrap();
            assert_eq!(got, expected, "size {size}");
        }
    }

    #[tokio::test]
    async fn test_roundtrip_maximum_size() {
        let limits = FrameLimits::default();
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let payload = vec![0xA5u8; MAX_MESSAGE_SIZE as usize];
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &payload, &limits).await.unwrap();
        });
        let got = read_frame(&mut b, &limits).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got.len(), MAX_MESSAGE_SIZE as usize);
        assert!(got.iter().all(|&b| b == 0xA5));
    }

    #[tokio::test]
    async fn test_frames_stay_separate() {
        let limits = FrameLimits::default();
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            write_frame(&mut a, b"first", &limits).await.unwrap();
            write_frame(&mut a, b"second", &limits).await.unwrap();
        });
        assert_eq!(read_frame(&mut b, &limits).await.unwrap(), b"first");
        assert_eq!(read_frame(&mut b, &limits).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_zero_length_rejected() {
        let mut reader = tokio_test::io::Builder::new().read(&[0, 0, 0, 0]).build();
        let err = read_frame(&mut reader, &quick_limits()).await.unwrap_err();
        assert!(matches!(err, WireError::EmptyMessage));
    }

    #[tokio::test]
    async fn test_oversized_rejected_without_reading_body() {
        let header = encode_length(MAX_MESSAGE_SIZE + 1);
        let mut reader = tokio_test::io::Builder::new().read(&header).build();
        let err = read_frame(&mut reader, &quick_limits()).await.unwrap_err();
        match err {
            WireError::MessageTooLarge { size, max } => {
                assert_eq!(size, u64::from(MAX_MESSAGE_SIZE) + 1);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_u32_max_header_rejected() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&[0xFF, 0xFF, 0xFF, 0xFF])
            .build();
        let err = read_frame(&mut reader, &quick_limits()).await.unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_eof_before_header_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b, &quick_limits()).await.unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_eof_inside_header_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x05, 0x00]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b, &quick_limits()).await.unwrap_err();
        match err {
            WireError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("Expected Io, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_header_split_across_reads() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&[3])
            .read(&[0, 0])
            .read(&[0])
            .read(b"abc")
            .build();
        let got = read_frame(&mut reader, &quick_limits()).await.unwrap();
        assert_eq!(got, b"abc");
    }

    #[tokio::test]
    async fn test_short_body_is_fatal() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&encode_length(10)).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let err = read_frame(&mut b, &quick_limits()).await.unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }

    #[tokio::test]
    async fn test_idle_read_times_out() {
        let (_a, mut b) = tokio::io::duplex(64);
        let err = read_frame(&mut b, &quick_limits()).await.unwrap_err();
        assert!(matches!(err, WireError::Timeout { operation: "read", .. }));
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&encode_length(8)).await.unwrap();
        a.write_all(b"half").await.unwrap();
        let err = read_frame(&mut b, &quick_limits()).await.unwrap_err();
        assert!(matches!(err, WireError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_write_refuses_empty_and_oversized() {
        let limits = FrameLimits {
            max_message_size: 8,
            ..quick_limits()
        };
        let (mut a, _b) = tokio::io::duplex(64);
        assert!(matches!(
            write_frame(&mut a, b"", &limits).await,
            Err(WireError::EmptyMessage)
        ));
        assert!(matches!(
            write_frame(&mut a, b"123456789", &limits).await,
            Err(WireError::MessageTooLarge { size: 9, max: 8 })
        ));
    }

    #[tokio::test]
    async fn test_blocked_write_times_out() {
        // Nobody reads from the other end and the pipe is tiny.
        let (mut a, _b) = tokio::io::duplex(8);
        let err = write_frame(&mut a, &[1u8; 64], &quick_limits())
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Timeout { operation: "write", .. }));
    }
}
