//! Length-prefixed framing: `<device_id>:<len>\n<len bytes>`.
//!
//! A connection carries any number of frames back to back. The only end
//! marker is the peer closing its side.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Largest payload a header may advertise.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;
/// Longest header line accepted, newline included.
pub const MAX_HEADER_LEN: usize = 256;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Truncated frame: {0}")]
    Truncated(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub device_id: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(device_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            device_id: device_id.into(),
            payload,
        }
    }

    /// Serialises the frame, refusing anything a reader could not parse back.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        check_device_id(&self.device_id)?;
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }

        let header = format!("{}:{}\n", self.device_id, self.payload.len());
        if header.len() > MAX_HEADER_LEN {
            return Err(FrameError::MalformedHeader(format!(
                "header longer than {} bytes",
                MAX_HEADER_LEN
            )));
        }

        let mut out = Vec::with_capacity(header.len() + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// A device id must be non-empty and free of line breaks.
pub fn check_device_id(device_id: &str) -> Result<(), FrameError> {
    if device_id.is_empty() {
        return Err(FrameError::MalformedHeader("empty device id".to_string()));
    }
    if device_id.contains(['\n', '\r']) {
        return Err(FrameError::MalformedHeader(format!(
            "line break in device id {:?}",
            device_id
        )));
    }
    Ok(())
}

/// Parses a header line (without its `\n`) into `(device_id, payload_len)`.
///
/// The split happens on the last `:` so identifiers may contain colons.
pub fn parse_header(line: &[u8]) -> Result<(String, usize), FrameError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = std::str::from_utf8(line)
        .map_err(|_| FrameError::MalformedHeader("header is not valid UTF-8".to_string()))?;

    let (device_id, len) = text
        .rsplit_once(':')
        .ok_or_else(|| FrameError::MalformedHeader(format!("missing ':' in {:?}", text)))?;

    if device_id.is_empty() {
        return Err(FrameError::MalformedHeader("empty device id".to_string()));
    }

    let len: usize = len
        .parse()
        .map_err(|_| FrameError::MalformedHeader(format!("invalid length {:?}", len)))?;

    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(len));
    }

    Ok((device_id.to_string(), len))
}

/// Pulls frames off a byte stream one at a time.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: Vec::with_capacity(64),
        }
    }

    /// Next frame, or `Ok(None)` when the peer closed cleanly between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        self.line.clear();
        let read = (&mut self.inner)
            .take(MAX_HEADER_LEN as u64)
            .read_until(b'\n', &mut self.line)
            .await?;

        if read == 0 {
            return Ok(None);
        }

        match self.line.last() {
            Some(b'\n') => {
                self.line.pop();
            }
            _ if read >= MAX_HEADER_LEN => {
                return Err(FrameError::MalformedHeader(format!(
                    "header longer than {} bytes",
                    MAX_HEADER_LEN
                )));
            }
            _ => {
                return Err(FrameError::Truncated(format!(
                    "connection closed inside header after {} bytes",
                    read
                )));
            }
        }

        let (device_id, len) = parse_header(&self.line)?;

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::Truncated(format!(
                    "expected {} payload bytes from {}",
                    len, device_id
                ))
            } else {
                FrameError::Io(e)
            }
        })?;

        Ok(Some(Frame { device_id, payload }))
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_encode_header() {
        let frame = Frame::new("meter_000001", vec![1, 2, 3]);
        assert_eq!(frame.encode().unwrap(), b"meter_000001:3\n\x01\x02\x03".to_vec());
    }

    #[test]
    fn test_encode_rejects_unparseable_ids() {
        for id in ["", "meter\n42", "meter_000001\r"] {
            let frame = Frame::new(id, vec![0u8; 16]);
            assert!(
                matches!(frame.encode(), Err(FrameError::MalformedHeader(_))),
                "{:?} should be rejected",
                id
            );
        }

        let long_id = "m".repeat(MAX_HEADER_LEN);
        assert!(Frame::new(long_id, vec![]).encode().is_err());

        let oversized = Frame::new("meter_000001", vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            oversized.encode(),
            Err(FrameError::PayloadTooLarge(_))
        ));

        // Colons stay legal since the header splits on the last one.
        let encoded = Frame::new("site:a:meter_1", vec![7]).encode().unwrap();
        assert_eq!(
            parse_header(&encoded[..encoded.len() - 2]).unwrap(),
            ("site:a:meter_1".to_string(), 1)
        );
    }

    #[test]
    fn test_parse_header_variants() {
        assert_eq!(parse_header(b"meter_1:16").unwrap(), ("meter_1".to_string(), 16));
        assert_eq!(parse_header(b"meter_1:16\r").unwrap(), ("meter_1".to_string(), 16));
        assert_eq!(parse_header(b"site:a:b:0").unwrap(), ("site:a:b".to_string(), 0));

        assert!(matches!(parse_header(b""), Err(FrameError::MalformedHeader(_))));
        assert!(matches!(parse_header(b"meter_1"), Err(FrameError::MalformedHeader(_))));
        assert!(matches!(parse_header(b":16"), Err(FrameError::MalformedHeader(_))));
        assert!(matches!(parse_header(b"meter_1:x"), Err(FrameError::MalformedHeader(_))));
        assert!(matches!(parse_header(b"meter_1:-1"), Err(FrameError::MalformedHeader(_))));
        assert!(matches!(
            parse_header(b"meter_1:65537"),
            Err(FrameError::PayloadTooLarge(65537))
        ));
    }

    #[tokio::test]
    async fn test_reads_many_frames_from_one_stream() {
        let mut stream = Vec::new();
        for i in 0..5u8 {
            stream.extend(
                Frame::new(format!("meter_00000{}", i), vec![i; 16])
                    .encode()
                    .unwrap(),
            );
        }

        let mut reader = FrameReader::new(&stream[..]);
        for i in 0..5u8 {
            let frame = reader.next_frame().await.unwrap().unwrap();
            assert_eq!(frame.device_id, format!("meter_00000{}", i));
            assert_eq!(frame.payload, vec![i; 16]);
        }
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let mock = Builder::new()
            .read(b"meter_0")
            .read(b"00001:4\nab")
            .read(b"cdmeter_000002:2\r\n")
            .read(b"xy")
            .build();

        let mut reader = FrameReader::new(mock);
        let first = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(first, Frame::new("meter_000001", b"abcd".to_vec()));
        let second = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(second, Frame::new("meter_000002", b"xy".to_vec()));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_fatal() {
        let mut reader = FrameReader::new(&b"meter_000001:16\nshort"[..]);
        assert!(matches!(reader.next_frame().await, Err(FrameError::Truncated(_))));
    }

    #[tokio::test]
    async fn test_truncated_header_is_fatal() {
        let mut reader = FrameReader::new(&b"meter_0000"[..]);
        assert!(matches!(reader.next_frame().await, Err(FrameError::Truncated(_))));
    }

    #[tokio::test]
    async fn test_oversized_header_is_rejected() {
        let long = vec![b'a'; MAX_HEADER_LEN + 10];
        let mut reader = FrameReader::new(&long[..]);
        assert!(matches!(reader.next_frame().await, Err(FrameError::MalformedHeader(_))));
    }

    #[tokio::test]
    async fn test_io_error_surfaces() {
        let mock = Builder::new()
            .read(b"meter_000001:4\n")
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let mut reader = FrameReader::new(mock);
        assert!(matches!(reader.next_frame().await, Err(FrameError::Io(_))));
    }
}
