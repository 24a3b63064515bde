use std::fmt;
use std::io::{self, Cursor, Read, Write};

use rmpv::Value;

use crate::protocol::{Frame, Message};

pub const MAX_MESSAGE_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

#[derive(Debug)]
pub enum CodecError {
    MessageTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    FrameLengthMismatch { declared: usize, actual_payload: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    MessageMustBeArray,
    FrameMustBeBinary,
    EmptyMessage,
    Io(io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageTooLarge { size, limit } => {
                write!(f, "message size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => {
                write!(f, "frame size {size} is smaller than 4-byte header")
            }
            Self::FrameLengthMismatch {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame length mismatch: declared {declared} bytes, actual payload {actual_payload} bytes"
            ),
            Self::ProtocolZeroLength => {
                write!(f, "protocol error: frame length cannot be zero")
            }
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::MessageMustBeArray => write!(f, "wire message must be an array of frames"),
            Self::FrameMustBeBinary => write!(f, "wire message frames must be binary values"),
            Self::EmptyMessage => write!(f, "wire message must contain at least one frame"),
            Self::Io(source) => write!(f, "frame io error: {source}"),
        }
    }
}

impl std::error::Error for CodecError {}

pub fn encode_frame(message: &[Frame]) -> Result<Vec<u8>, CodecError> {
    let payload = encode_payload(message)?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
    let len = payload.len() as u32;
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode_frame(frame: &[u8]) -> Result<Message, CodecError> {
    if frame.len() < FRAME_HEADER_SIZE_BYTES {
        return Err(CodecError::FrameTooShort { size: frame.len() });
    }

    let declared_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if declared_len == 0 {
        return Err(CodecError::ProtocolZeroLength);
    }
    if declared_len > MAX_MESSAGE_SIZE_BYTES {
        return Err(CodecError::ProtocolLengthTooLarge {
            length: declared_len,
            limit: MAX_MESSAGE_SIZE_BYTES,
        });
    }

    let payload = &frame[FRAME_HEADER_SIZE_BYTES..];
    if payload.len() != declared_len {
        return Err(CodecError::FrameLengthMismatch {
            declared: declared_len,
            actual_payload: payload.len(),
        });
    }

    decode_payload(payload)
}

pub fn encode_payload(message: &[Frame]) -> Result<Vec<u8>, CodecError> {
    if message.is_empty() {
        return Err(CodecError::EmptyMessage);
    }

    let frames = message
        .iter()
        .map(|frame| Value::Binary(frame.clone()))
        .collect::<Vec<_>>();
    let value = Value::Array(frames);

    let mut encoded = Vec::new();
    rmpv::encode::write_value(&mut encoded, &value).map_err(CodecError::MessagePackEncode)?;

    if encoded.len() > MAX_MESSAGE_SIZE_BYTES {
        return Err(CodecError::MessageTooLarge {
            size: encoded.len(),
            limit: MAX_MESSAGE_SIZE_BYTES,
        });
    }

    Ok(encoded)
}

pub fn decode_payload(payload: &[u8]) -> Result<Message, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::ProtocolZeroLength);
    }
    if payload.len() > MAX_MESSAGE_SIZE_BYTES {
        return Err(CodecError::MessageTooLarge {
            size: payload.len(),
            limit: MAX_MESSAGE_SIZE_BYTES,
        });
    }

    let mut cursor = Cursor::new(payload);
    let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
    if cursor.position() as usize != payload.len() {
        return Err(CodecError::TrailingDataInPayload);
    }

    parse_message(value)
}

// Pops one complete wire frame off the front of a connection read buffer.
// Returns Ok(None) while the buffer holds only a partial frame.
pub fn extract_message(buffer: &mut Vec<u8>) -> Result<Option<Message>, CodecError> {
    if buffer.len() < FRAME_HEADER_SIZE_BYTES {
        return Ok(None);
    }

    let declared_len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if declared_len == 0 {
        return Err(CodecError::ProtocolZeroLength);
    }
    if declared_len > MAX_MESSAGE_SIZE_BYTES {
        return Err(CodecError::ProtocolLengthTooLarge {
            length: declared_len,
            limit: MAX_MESSAGE_SIZE_BYTES,
        });
    }

    let total = FRAME_HEADER_SIZE_BYTES + declared_len;
    if buffer.len() < total {
        return Ok(None);
    }

    let frame = buffer.drain(..total).collect::<Vec<u8>>();
    decode_frame(&frame).map(Some)
}

pub fn write_message(writer: &mut impl Write, message: &[Frame]) -> Result<(), CodecError> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame).map_err(CodecError::Io)?;
    writer.flush().map_err(CodecError::Io)
}

pub fn read_message(reader: &mut impl Read) -> Result<Message, CodecError> {
    let mut header = [0_u8; FRAME_HEADER_SIZE_BYTES];
    reader.read_exact(&mut header).map_err(CodecError::Io)?;

    let declared_len = u32::from_be_bytes(header) as usize;
    if declared_len == 0 {
        return Err(CodecError::ProtocolZeroLength);
    }
    if declared_len > MAX_MESSAGE_SIZE_BYTES {
        return Err(CodecError::ProtocolLengthTooLarge {
            length: declared_len,
            limit: MAX_MESSAGE_SIZE_BYTES,
        });
    }

    let mut payload = vec![0_u8; declared_len];
    reader.read_exact(&mut payload).map_err(CodecError::Io)?;
    decode_payload(&payload)
}

fn parse_message(value: Value) -> Result<Message, CodecError> {
    let Value::Array(entries) = value else {
        return Err(CodecError::MessageMustBeArray);
    };

    if entries.is_empty() {
        return Err(CodecError::EmptyMessage);
    }

    let mut message = Message::with_capacity(entries.len());
    for entry in entries {
        let Value::Binary(frame) = entry else {
            return Err(CodecError::FrameMustBeBinary);
        };
        message.push(frame);
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::{
        decode_frame, decode_payload, encode_frame, extract_message, read_message, write_message,
        CodecError, MAX_MESSAGE_SIZE_BYTES,
    };
    use rmpv::Value;

    fn sample_message() -> Vec<Vec<u8>> {
        vec![
            Vec::new(),
            b"MDPC01".to_vec(),
            b"echo".to_vec(),
            b"hello".to_vec(),
        ]
    }

    #[test]
    fn round_trip_frame_encode_decode() {
        let message = sample_message();
        let frame = encode_frame(&message).expect("frame should encode");
        let decoded = decode_frame(&frame).expect("frame should decode");

        assert_eq!(decoded, message);
    }

    #[test]
    fn empty_delimiter_frames_survive_the_codec() {
        let message = vec![Vec::new(), b"MDPW01".to_vec(), vec![0x04]];
        let frame = encode_frame(&message).expect("frame should encode");
        let decoded = decode_frame(&frame).expect("frame should decode");

        assert_eq!(decoded[0], Vec::<u8>::new());
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn rejects_zero_frame_message_on_encode() {
        let error = encode_frame(&[]).expect_err("empty message should be rejected");
        assert!(matches!(error, CodecError::EmptyMessage));
    }

    #[test]
    fn rejects_zero_length_frame() {
        let frame = [0_u8, 0, 0, 0];
        let error = decode_frame(&frame).expect_err("zero-length frame should fail");

        assert!(matches!(error, CodecError::ProtocolZeroLength));
    }

    #[test]
    fn rejects_frame_larger_than_limit() {
        let declared = (MAX_MESSAGE_SIZE_BYTES as u32 + 1).to_be_bytes();
        let frame = declared.to_vec();
        let error = decode_frame(&frame).expect_err("oversized frame should fail");

        assert!(matches!(error, CodecError::ProtocolLengthTooLarge { .. }));
    }

    #[test]
    fn rejects_length_mismatch() {
        let message = sample_message();
        let mut frame = encode_frame(&message).expect("frame should encode");
        frame.pop();

        let error = decode_frame(&frame).expect_err("truncated frame should fail");
        assert!(matches!(error, CodecError::FrameLengthMismatch { .. }));
    }

    #[test]
    fn rejects_non_array_payload() {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &Value::String("frames".into()))
            .expect("test payload should encode");

        let error = decode_payload(&payload).expect_err("non-array payload should fail");
        assert!(matches!(error, CodecError::MessageMustBeArray));
    }

    #[test]
    fn rejects_non_binary_frame_entries() {
        let value = Value::Array(vec![Value::String("not-binary".into())]);
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &value).expect("test payload should encode");

        let error = decode_payload(&payload).expect_err("non-binary frame should fail");
        assert!(matches!(error, CodecError::FrameMustBeBinary));
    }

    #[test]
    fn rejects_trailing_data_in_payload() {
        let value = Value::Array(vec![Value::Binary(b"x".to_vec())]);
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &value).expect("first object should encode");
        rmpv::encode::write_value(&mut payload, &Value::Nil).expect("second object should encode");

        let error = decode_payload(&payload).expect_err("trailing data should fail");
        assert!(matches!(error, CodecError::TrailingDataInPayload));
    }

    #[test]
    fn extract_message_waits_for_complete_frame() {
        let message = sample_message();
        let frame = encode_frame(&message).expect("frame should encode");

        let mut buffer = frame[..frame.len() - 1].to_vec();
        let partial = extract_message(&mut buffer).expect("partial frame should not error");
        assert!(partial.is_none());
        assert_eq!(buffer.len(), frame.len() - 1);

        buffer.push(frame[frame.len() - 1]);
        let extracted = extract_message(&mut buffer)
            .expect("complete frame should extract")
            .expect("message should be present");
        assert_eq!(extracted, message);
        assert!(buffer.is_empty());
    }

    #[test]
    fn extract_message_drains_one_frame_at_a_time() {
        let first = sample_message();
        let second = vec![b"only".to_vec()];
        let second_frame = encode_frame(&second).expect("second frame should encode");

        let mut buffer = encode_frame(&first).expect("first frame should encode");
        buffer.extend_from_slice(&second_frame);

        let extracted_first = extract_message(&mut buffer)
            .expect("first extraction should pass")
            .expect("first message should be present");
        assert_eq!(extracted_first, first);
        assert_eq!(buffer.len(), second_frame.len());

        let extracted_second = extract_message(&mut buffer)
            .expect("second extraction should pass")
            .expect("second message should be present");
        assert_eq!(extracted_second, second);
        assert!(buffer.is_empty());
    }

    #[test]
    fn blocking_read_write_round_trip() {
        let message = sample_message();
        let mut wire = Vec::new();
        write_message(&mut wire, &message).expect("message should write");

        let mut cursor = std::io::Cursor::new(wire);
        let decoded = read_message(&mut cursor).expect("message should read back");
        assert_eq!(decoded, message);
    }

    #[test]
    fn blocking_read_surfaces_io_errors() {
        let mut cursor = std::io::Cursor::new(vec![0_u8, 0]);
        let error = read_message(&mut cursor).expect_err("short stream should fail");
        assert!(matches!(error, CodecError::Io(_)));
    }
}
