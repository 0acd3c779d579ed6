//! Message types carried by the fabric and the network path
//!
//! [`Message`] flows between nodes (in-process and, via the wire codec,
//! across TCP); [`Request`]/[`Reply`] form the client-facing session
//! protocol. All payloads are opaque UTF-8 strings; `connect_*` messages
//! carry an edge handle rendered as decimal text.

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::clock::ScalarTime;

/// What a fabric message means to its receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Unknown,
    PortData,
    ConnectSender,
    ConnectReceiver,
    DisconnectSender,
    DisconnectReceiver,
}

/// A typed, clock-stamped message between two addressed nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub time: ScalarTime,
    pub sender: Address,
    pub receiver: Address,
    pub kind: MessageKind,
    pub data: String,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        sender: Address,
        receiver: Address,
        time: ScalarTime,
        data: impl Into<String>,
    ) -> Self {
        Message {
            time,
            sender,
            receiver,
            kind,
            data: data.into(),
        }
    }
}

/// Client request kinds understood by a network session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Ping,
    InputData,
    DebugStart,
    DebugStop,
}

/// A framed client request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub kind: RequestKind,
    #[serde(default)]
    pub data: String,
}

impl Request {
    pub fn new(kind: RequestKind, data: impl Into<String>) -> Self {
        Request {
            kind,
            data: data.into(),
        }
    }
}

/// Server reply kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    Pong,
    OutputData,
}

/// A framed server reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub kind: ReplyKind,
    #[serde(default)]
    pub data: String,
}

impl Reply {
    pub fn new(kind: ReplyKind, data: impl Into<String>) -> Self {
        Reply {
            kind,
            data: data.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip_arbitrary_utf8() {
        let msg = Message::new(
            MessageKind::PortData,
            Address::new(0, 0, 1, 2),
            Address::new(0, 0, 1, 3),
            ScalarTime::new(17),
            "päyløad \u{1F680} with\nnewlines and \"quotes\"",
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_kind_tags_are_stable() {
        let json = serde_json::to_string(&MessageKind::ConnectSender).unwrap();
        assert_eq!(json, "\"connect_sender\"");
        let json = serde_json::to_string(&RequestKind::InputData).unwrap();
        assert_eq!(json, "\"input_data\"");
        let json = serde_json::to_string(&ReplyKind::Pong).unwrap();
        assert_eq!(json, "\"pong\"");
    }

    #[test]
    fn test_request_reply_round_trip() {
        let req = Request::new(RequestKind::Ping, "");
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);

        let rep = Reply::new(ReplyKind::OutputData, "hello");
        let json = serde_json::to_string(&rep).unwrap();
        let back: Reply = serde_json::from_str(&json).unwrap();
        assert_eq!(rep, back);
    }
}
