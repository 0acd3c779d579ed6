//! Newline-delimited wire framing
//!
//! One JSON object per line; the terminating `\n` is the frame boundary
//! shared by every client and server on the fabric. Any serde value can
//! travel this way, which keeps the schema concern out of the transport.

use std::io::{BufRead, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::FabricResult;

/// Encode one frame: the JSON rendering of `value` plus a newline
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> FabricResult<()> {
    serde_json::to_writer(&mut *writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Decode one frame; `Ok(None)` on clean end-of-stream
pub fn read_frame<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> FabricResult<Option<T>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    let value = serde_json::from_str(line.trim_end_matches(['\r', '\n']))?;
    Ok(Some(value))
}

/// Render a value as a single frame in memory
pub fn encode_frame<T: Serialize>(value: &T) -> FabricResult<Vec<u8>> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode a single frame from a complete line (no trailing newline needed)
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> FabricResult<T> {
    Ok(serde_json::from_str(line.trim_end_matches(['\r', '\n']))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::clock::ScalarTime;
    use crate::message::{Message, MessageKind, Reply, ReplyKind, Request, RequestKind};
    use std::io::Cursor;

    #[test]
    fn test_frame_round_trip() {
        let mut buf = Vec::new();
        let req = Request::new(RequestKind::InputData, "hello");
        write_frame(&mut buf, &req).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let mut reader = Cursor::new(buf);
        let back: Request = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(req, back);
        // Stream exhausted
        assert!(read_frame::<_, Request>(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_multiple_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Reply::new(ReplyKind::Pong, "pong")).unwrap();
        write_frame(&mut buf, &Reply::new(ReplyKind::OutputData, "abc")).unwrap();

        let mut reader = Cursor::new(buf);
        let first: Reply = read_frame(&mut reader).unwrap().unwrap();
        let second: Reply = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(first.kind, ReplyKind::Pong);
        assert_eq!(second.data, "abc");
    }

    #[test]
    fn test_message_over_the_wire() {
        let msg = Message::new(
            MessageKind::ConnectSender,
            Address::new(1, 0, 0, 1),
            Address::new(1, 0, 0, 2),
            ScalarTime::new(3),
            "281474976710656",
        );
        let bytes = encode_frame(&msg).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        let back: Message = decode_frame(text).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_garbage_frame_is_an_error() {
        let mut reader = Cursor::new(b"not json at all\n".to_vec());
        assert!(read_frame::<_, Request>(&mut reader).is_err());
    }
}
