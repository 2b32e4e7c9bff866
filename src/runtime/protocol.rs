//! Length-prefixed framing for the runtime.
//!
//! Every message on the wire is a 4-byte native-endian unsigned length
//! followed by exactly that many payload bytes:
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32)   | payload (length bytes)    |
//! +----------------+---------------------------+
//!
//! Request:  5 "hello"
//! Response: 21 "Server response: ack!"
//! ```
//!
//! The payload is capped at [`MAX_PAYLOAD`] bytes. The server answers every
//! request with the same [`ACKNOWLEDGEMENT`], whatever the request carried.
//!
//! Parsing works on raw byte buffers and never blocks; the blocking
//! [`write_frame`] / [`read_frame`] helpers are for clients.

use std::io::{self, Read, Write};
use thiserror::Error;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload a frame may declare.
pub const MAX_PAYLOAD: usize = 256;

/// Largest complete frame, header included. Sizes the connection buffers.
pub const MAX_FRAME: usize = HEADER_LEN + MAX_PAYLOAD;

/// Payload of every response frame.
pub const ACKNOWLEDGEMENT: &[u8] = b"Server response: ack!";

/// Framing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Declared or supplied payload exceeds [`MAX_PAYLOAD`].
    #[error("payload length {declared} exceeds maximum of {max}", max = MAX_PAYLOAD)]
    Oversize { declared: usize },
    /// Output buffer cannot hold the encoded frame.
    #[error("frame needs {needed} bytes but only {available} are available")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Outcome of decoding the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// A complete frame; `consumed` covers header and payload.
    Frame { payload: &'a [u8], consumed: usize },
    /// Not enough bytes yet. Nothing was consumed.
    NeedData,
}

/// Result of processing one request out of a read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Need more data to complete the frame.
    NeedData,
    /// A request was decoded and its response encoded into the output.
    Response {
        /// Bytes of the request frame (header included).
        consumed: usize,
        /// Length of the request payload.
        payload_len: usize,
        /// Bytes of the response frame written to the output.
        response_len: usize,
    },
}

/// Decode the frame at the front of `input`.
///
/// An oversize length is reported as soon as the header is visible, before
/// any of the payload arrives.
pub fn decode(input: &[u8]) -> Result<Decoded<'_>, FrameError> {
    let Some(header) = input.first_chunk::<HEADER_LEN>() else {
        return Ok(Decoded::NeedData);
    };

    let declared = u32::from_ne_bytes(*header) as usize;
    if declared > MAX_PAYLOAD {
        return Err(FrameError::Oversize { declared });
    }

    let consumed = HEADER_LEN + declared;
    if input.len() < consumed {
        return Ok(Decoded::NeedData);
    }

    Ok(Decoded::Frame {
        payload: &input[HEADER_LEN..consumed],
        consumed,
    })
}

/// Encode `payload` as a frame at the start of `output`.
///
/// Returns the number of bytes written.
pub fn encode(payload: &[u8], output: &mut [u8]) -> Result<usize, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::Oversize {
            declared: payload.len(),
        });
    }

    let needed = HEADER_LEN + payload.len();
    if output.len() < needed {
        return Err(FrameError::BufferTooSmall {
            needed,
            available: output.len(),
        });
    }

    // Bounded by MAX_PAYLOAD above.
    let len = payload.len() as u32;
    output[..HEADER_LEN].copy_from_slice(&len.to_ne_bytes());
    output[HEADER_LEN..needed].copy_from_slice(payload);
    Ok(needed)
}

/// Decode one request from `input` and encode the acknowledgement into
/// `output`.
pub fn process_request(input: &[u8], output: &mut [u8]) -> Result<ProcessResult, FrameError> {
    match decode(input)? {
        Decoded::NeedData => Ok(ProcessResult::NeedData),
        Decoded::Frame { payload, consumed } => {
            let response_len = encode(ACKNOWLEDGEMENT, output)?;
            Ok(ProcessResult::Response {
                consumed,
                payload_len: payload.len(),
                response_len,
            })
        }
    }
}

/// Write one frame carrying `payload` to a blocking writer.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut frame = [0u8; MAX_FRAME];
    let len = encode(payload, &mut frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame[..len])
}

/// Read one frame from a blocking reader and return its payload.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let declared = u32::from_ne_bytes(header) as usize;
    if declared > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            FrameError::Oversize { declared },
        ));
    }

    let mut payload = vec![0u8; declared];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_ne_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_acknowledgement_length() {
        assert_eq!(ACKNOWLEDGEMENT.len(), 21);
    }

    #[test]
    fn test_decode_complete() {
        let input = frame(b"hello");
        match decode(&input) {
            Ok(Decoded::Frame { payload, consumed }) => {
                assert_eq!(payload, b"hello");
                assert_eq!(consumed, 9);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_empty_payload() {
        let input = frame(b"");
        assert_eq!(
            decode(&input),
            Ok(Decoded::Frame {
                payload: b"",
                consumed: HEADER_LEN
            })
        );
    }

    #[test]
    fn test_decode_incomplete() {
        assert_eq!(decode(b""), Ok(Decoded::NeedData));
        assert_eq!(decode(&[5, 0]), Ok(Decoded::NeedData));

        let input = frame(b"hello");
        assert_eq!(decode(&input[..HEADER_LEN]), Ok(Decoded::NeedData));
        assert_eq!(decode(&input[..7]), Ok(Decoded::NeedData));
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let mut input = frame(b"one");
        input.extend_from_slice(&frame(b"two"));

        match decode(&input) {
            Ok(Decoded::Frame { payload, consumed }) => {
                assert_eq!(payload, b"one");
                assert_eq!(consumed, 7);
                assert_eq!(
                    decode(&input[consumed..]),
                    Ok(Decoded::Frame {
                        payload: b"two",
                        consumed: 7
                    })
                );
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_max_payload() {
        let input = frame(&[b'x'; MAX_PAYLOAD]);
        match decode(&input) {
            Ok(Decoded::Frame { payload, consumed }) => {
                assert_eq!(payload.len(), MAX_PAYLOAD);
                assert_eq!(consumed, MAX_FRAME);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_oversize_header_only() {
        let header = 300u32.to_ne_bytes();
        assert_eq!(
            decode(&header),
            Err(FrameError::Oversize { declared: 300 })
        );
    }

    #[test]
    fn test_encode() {
        let mut out = [0u8; MAX_FRAME];
        let len = encode(b"hello", &mut out).unwrap();
        assert_eq!(&out[..len], frame(b"hello").as_slice());
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let mut out = [0u8; 1024];
        assert_eq!(
            encode(&[0u8; MAX_PAYLOAD + 1], &mut out),
            Err(FrameError::Oversize {
                declared: MAX_PAYLOAD + 1
            })
        );
    }

    #[test]
    fn test_encode_buffer_too_small() {
        let mut out = [0u8; 6];
        assert_eq!(
            encode(b"hello", &mut out),
            Err(FrameError::BufferTooSmall {
                needed: 9,
                available: 6
            })
        );
    }

    #[test]
    fn test_process_request_ignores_request_content() {
        let mut out_a = [0u8; MAX_FRAME];
        let mut out_b = [0u8; MAX_FRAME];

        let a = process_request(&frame(b"first"), &mut out_a).unwrap();
        let b = process_request(&frame(&[7u8; 200]), &mut out_b).unwrap();

        assert_eq!(
            a,
            ProcessResult::Response {
                consumed: 9,
                payload_len: 5,
                response_len: HEADER_LEN + ACKNOWLEDGEMENT.len()
            }
        );
        assert!(matches!(b, ProcessResult::Response { consumed: 204, .. }));
        assert_eq!(out_a[..25], out_b[..25]);
        assert_eq!(&out_a[HEADER_LEN..25], ACKNOWLEDGEMENT);
    }

    #[test]
    fn test_process_request_need_data() {
        let mut out = [0u8; MAX_FRAME];
        assert_eq!(
            process_request(&frame(b"hello")[..6], &mut out),
            Ok(ProcessResult::NeedData)
        );
    }

    #[test]
    fn test_blocking_helpers() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"ping").unwrap();
        assert_eq!(wire, frame(b"ping"));

        let mut reader = wire.as_slice();
        assert_eq!(read_frame(&mut reader).unwrap(), b"ping");
    }

    #[test]
    fn test_read_frame_rejects_oversize() {
        let wire = 1000u32.to_ne_bytes();
        let err = read_frame(&mut wire.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
