//! Binary frame protocol between browser clients and the server.
//!
//! Every WebSocket binary message is one frame: byte 0 is the type, the
//! remainder is type-specific payload. Multi-byte integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame type byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    // Client → server
    Stdin = 0x01,
    Resize = 0x04,
    FileStart = 0x10,
    FileChunk = 0x11,

    // Server → client
    Stdout = 0x02,
    Exit = 0x05,
    FileAck = 0x12,
    WriteState = 0x20,
    SessionsChange = 0x21,
    ResizeNotify = 0x22,
    ClientCount = 0x23,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Stdin),
            0x02 => Some(Self::Stdout),
            0x04 => Some(Self::Resize),
            0x05 => Some(Self::Exit),
            0x10 => Some(Self::FileStart),
            0x11 => Some(Self::FileChunk),
            0x12 => Some(Self::FileAck),
            0x20 => Some(Self::WriteState),
            0x21 => Some(Self::SessionsChange),
            0x22 => Some(Self::ResizeNotify),
            0x23 => Some(Self::ClientCount),
            _ => None,
        }
    }
}

/// File transfer acknowledgement status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Success = 0x00,
    Progress = 0x01,
    Error = 0x02,
}

impl AckStatus {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Success),
            0x01 => Some(Self::Progress),
            0x02 => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownType(u8),
    #[error("truncated {0} frame")]
    Truncated(&'static str),
    #[error("invalid file ack status: 0x{0:02x}")]
    BadAckStatus(u8),
}

/// A decoded protocol frame.
///
/// `FileStart` carries the declared name as raw bytes; content rules
/// (UTF-8, no separators, …) are enforced by the upload machine so a bad
/// name produces an acknowledgement error rather than a protocol close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stdin(Bytes),
    Stdout(Bytes),
    Resize { cols: u16, rows: u16 },
    Exit(u32),
    FileStart { size: u32, name: Bytes },
    FileChunk { offset: u32, data: Bytes },
    FileAck { status: AckStatus, message: String },
    WriteState(bool),
    SessionsChange,
    ResizeNotify { cols: u16, rows: u16 },
    ClientCount(u16),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Stdin(_) => FrameType::Stdin,
            Frame::Stdout(_) => FrameType::Stdout,
            Frame::Resize { .. } => FrameType::Resize,
            Frame::Exit(_) => FrameType::Exit,
            Frame::FileStart { .. } => FrameType::FileStart,
            Frame::FileChunk { .. } => FrameType::FileChunk,
            Frame::FileAck { .. } => FrameType::FileAck,
            Frame::WriteState(_) => FrameType::WriteState,
            Frame::SessionsChange => FrameType::SessionsChange,
            Frame::ResizeNotify { .. } => FrameType::ResizeNotify,
            Frame::ClientCount(_) => FrameType::ClientCount,
        }
    }

    /// Shorthand for a file acknowledgement frame.
    pub fn ack(status: AckStatus, message: impl Into<String>) -> Self {
        Frame::FileAck {
            status,
            message: message.into(),
        }
    }

    /// Encode this frame into a wire message.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.frame_type() as u8);
        match self {
            Frame::Stdin(data) | Frame::Stdout(data) => buf.put(data.as_ref()),
            Frame::Resize { cols, rows } | Frame::ResizeNotify { cols, rows } => {
                buf.put_u16(*cols);
                buf.put_u16(*rows);
            }
            Frame::Exit(code) => buf.put_u32(*code),
            Frame::FileStart { size, name } => {
                buf.put_u32(*size);
                buf.put_u16(name.len() as u16);
                buf.put(name.as_ref());
            }
            Frame::FileChunk { offset, data } => {
                buf.put_u32(*offset);
                buf.put(data.as_ref());
            }
            Frame::FileAck { status, message } => {
                buf.put_u8(*status as u8);
                buf.put(message.as_bytes());
            }
            Frame::WriteState(is_writer) => buf.put_u8(u8::from(*is_writer)),
            Frame::SessionsChange => {}
            Frame::ClientCount(count) => buf.put_u16(*count),
        }
        buf.freeze()
    }

    /// Decode a wire message.
    ///
    /// `Err(FrameError::UnknownType)` marks a frame the receiver should
    /// skip; any other error is a protocol violation.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let mut data = data;
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        let type_byte = data.get_u8();
        let frame_type = FrameType::from_u8(type_byte).ok_or(FrameError::UnknownType(type_byte))?;

        match frame_type {
            FrameType::Stdin => Ok(Frame::Stdin(Bytes::copy_from_slice(data))),
            FrameType::Stdout => Ok(Frame::Stdout(Bytes::copy_from_slice(data))),
            FrameType::Resize => {
                if data.remaining() < 4 {
                    return Err(FrameError::Truncated("resize"));
                }
                Ok(Frame::Resize {
                    cols: data.get_u16(),
                    rows: data.get_u16(),
                })
            }
            FrameType::Exit => {
                if data.remaining() < 4 {
                    return Err(FrameError::Truncated("exit"));
                }
                Ok(Frame::Exit(data.get_u32()))
            }
            FrameType::FileStart => {
                if data.remaining() < 6 {
                    return Err(FrameError::Truncated("file start"));
                }
                let size = data.get_u32();
                let name_len = data.get_u16() as usize;
                if data.remaining() < name_len {
                    return Err(FrameError::Truncated("file start"));
                }
                Ok(Frame::FileStart {
                    size,
                    name: Bytes::copy_from_slice(&data[..name_len]),
                })
            }
            FrameType::FileChunk => {
                if data.remaining() < 4 {
                    return Err(FrameError::Truncated("file chunk"));
                }
                Ok(Frame::FileChunk {
                    offset: data.get_u32(),
                    data: Bytes::copy_from_slice(data),
                })
            }
            FrameType::FileAck => {
                if data.remaining() < 1 {
                    return Err(FrameError::Truncated("file ack"));
                }
                let status_byte = data.get_u8();
                let status =
                    AckStatus::from_u8(status_byte).ok_or(FrameError::BadAckStatus(status_byte))?;
                Ok(Frame::FileAck {
                    status,
                    message: String::from_utf8_lossy(data).into_owned(),
                })
            }
            FrameType::WriteState => {
                if data.remaining() < 1 {
                    return Err(FrameError::Truncated("write state"));
                }
                Ok(Frame::WriteState(data.get_u8() != 0))
            }
            FrameType::SessionsChange => Ok(Frame::SessionsChange),
            FrameType::ResizeNotify => {
                if data.remaining() < 4 {
                    return Err(FrameError::Truncated("resize notify"));
                }
                Ok(Frame::ResizeNotify {
                    cols: data.get_u16(),
                    rows: data.get_u16(),
                })
            }
            FrameType::ClientCount => {
                if data.remaining() < 2 {
                    return Err(FrameError::Truncated("client count"));
                }
                Ok(Frame::ClientCount(data.get_u16()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_round_trip() {
        let types = [
            FrameType::Stdin,
            FrameType::Stdout,
            FrameType::Resize,
            FrameType::Exit,
            FrameType::FileStart,
            FrameType::FileChunk,
            FrameType::FileAck,
            FrameType::WriteState,
            FrameType::SessionsChange,
            FrameType::ResizeNotify,
            FrameType::ClientCount,
        ];
        for ft in types {
            assert_eq!(FrameType::from_u8(ft as u8), Some(ft));
        }
    }

    #[test]
    fn frame_type_invalid_byte() {
        assert!(FrameType::from_u8(0x00).is_none());
        assert!(FrameType::from_u8(0x03).is_none());
        assert!(FrameType::from_u8(0xFF).is_none());
    }

    #[test]
    fn stdin_round_trip() {
        let frame = Frame::Stdin(Bytes::from_static(b"echo hi\n"));
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn stdout_preserves_escape_sequences() {
        let payload = Bytes::from_static(b"\x1b[2J\x1b[Hhello");
        let frame = Frame::Stdout(payload.clone());
        match Frame::decode(&frame.encode()).unwrap() {
            Frame::Stdout(data) => assert_eq!(data, payload),
            other => panic!("expected stdout, got {other:?}"),
        }
    }

    #[test]
    fn resize_wire_layout() {
        let frame = Frame::Resize { cols: 80, rows: 24 };
        let encoded = frame.encode();
        assert_eq!(encoded.as_ref(), &[0x04, 0x00, 0x50, 0x00, 0x18]);
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn resize_zero_dims_decodes() {
        let decoded = Frame::decode(&[0x04, 0, 0, 0, 0]).unwrap();
        assert_eq!(decoded, Frame::Resize { cols: 0, rows: 0 });
    }

    #[test]
    fn resize_truncated() {
        assert_eq!(
            Frame::decode(&[0x04, 0x00, 0x50]),
            Err(FrameError::Truncated("resize"))
        );
    }

    #[test]
    fn exit_wire_layout() {
        let frame = Frame::Exit(0);
        assert_eq!(frame.encode().as_ref(), &[0x05, 0, 0, 0, 0]);

        // -1 as u32 for abnormal termination
        let frame = Frame::Exit(u32::MAX);
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn file_start_round_trip() {
        let frame = Frame::FileStart {
            size: 10,
            name: Bytes::from_static(b"hi.txt"),
        };
        let encoded = frame.encode();
        assert_eq!(
            encoded.as_ref(),
            &[0x10, 0, 0, 0, 10, 0, 6, b'h', b'i', b'.', b't', b'x', b't']
        );
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn file_start_name_length_beyond_payload() {
        // declares a 10-byte name but provides only 2
        let data = [0x10, 0, 0, 0, 1, 0, 10, b'a', b'b'];
        assert_eq!(
            Frame::decode(&data),
            Err(FrameError::Truncated("file start"))
        );
    }

    #[test]
    fn file_chunk_round_trip() {
        let frame = Frame::FileChunk {
            offset: 32768,
            data: Bytes::from_static(b"payload"),
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn file_chunk_empty_data() {
        let frame = Frame::FileChunk {
            offset: 0,
            data: Bytes::new(),
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn file_ack_with_message() {
        let frame = Frame::ack(AckStatus::Error, "offset mismatch");
        let encoded = frame.encode();
        assert_eq!(encoded[0], 0x12);
        assert_eq!(encoded[1], 0x02);
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn file_ack_without_message() {
        let frame = Frame::ack(AckStatus::Progress, "");
        let encoded = frame.encode();
        assert_eq!(encoded.as_ref(), &[0x12, 0x01]);
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn file_ack_bad_status() {
        assert_eq!(
            Frame::decode(&[0x12, 0x07]),
            Err(FrameError::BadAckStatus(0x07))
        );
    }

    #[test]
    fn write_state_round_trip() {
        assert_eq!(
            Frame::decode(&Frame::WriteState(true).encode()).unwrap(),
            Frame::WriteState(true)
        );
        assert_eq!(
            Frame::decode(&Frame::WriteState(false).encode()).unwrap(),
            Frame::WriteState(false)
        );
    }

    #[test]
    fn sessions_change_is_bare() {
        let encoded = Frame::SessionsChange.encode();
        assert_eq!(encoded.as_ref(), &[0x21]);
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::SessionsChange);
    }

    #[test]
    fn client_count_round_trip() {
        let frame = Frame::ClientCount(3);
        assert_eq!(frame.encode().as_ref(), &[0x23, 0, 3]);
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn resize_notify_round_trip() {
        let frame = Frame::ResizeNotify {
            cols: 120,
            rows: 40,
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn empty_message_rejected() {
        assert_eq!(Frame::decode(&[]), Err(FrameError::Empty));
    }

    #[test]
    fn unknown_type_reported_with_byte() {
        assert_eq!(Frame::decode(&[0x7F, 1, 2]), Err(FrameError::UnknownType(0x7F)));
    }
}
