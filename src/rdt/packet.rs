// rdt/packet.rs

#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::rdt::common::{Algorithm, ErrorCode, RoomCode, SessionKey, TransferError};

/// One slice of the payload as it travels in a DATA message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 1-based position in the stream
    pub seq: u32,
    pub total: u32,
    pub payload: Bytes,
}

/// Every datagram exchanged by peers: a JSON object discriminated by `kind`.
///
/// `room` and `filename` are present on every variant so the server can
/// demultiplex without any connection identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Message {
    #[serde(rename = "SYN")]
    Syn {
        room: RoomCode,
        filename: String,
        total: u32,
        algo: Algorithm,
    },
    #[serde(rename = "SYN-ACK")]
    SynAck {
        room: RoomCode,
        filename: String,
        total: u32,
    },
    #[serde(rename = "ACK")]
    Ack {
        room: RoomCode,
        filename: String,
        ack: u32,
        rwnd: u32,
    },
    #[serde(rename = "DATA")]
    Data {
        room: RoomCode,
        filename: String,
        seq: u32,
        total: u32,
        #[serde(with = "base64_payload")]
        payload: Bytes,
    },
    #[serde(rename = "DOWNLOAD")]
    Download {
        room: RoomCode,
        filename: String,
        algo: Algorithm,
    },
    #[serde(rename = "FIN")]
    Fin { room: RoomCode, filename: String },
    #[serde(rename = "FIN-ACK")]
    FinAck { room: RoomCode, filename: String },
    #[serde(rename = "ERROR")]
    Error {
        room: RoomCode,
        filename: String,
        code: ErrorCode,
        msg: String,
    },
}

impl Message {
    pub fn data(room: &RoomCode, filename: &str, segment: &Segment) -> Self {
        Message::Data {
            room: room.clone(),
            filename: filename.to_string(),
            seq: segment.seq,
            total: segment.total,
            payload: segment.payload.clone(),
        }
    }

    pub fn ack(room: &RoomCode, filename: &str, ack: u32, rwnd: u32) -> Self {
        Message::Ack { room: room.clone(), filename: filename.to_string(), ack, rwnd }
    }

    pub fn fin(room: &RoomCode, filename: &str) -> Self {
        Message::Fin { room: room.clone(), filename: filename.to_string() }
    }

    pub fn fin_ack(room: &RoomCode, filename: &str) -> Self {
        Message::FinAck { room: room.clone(), filename: filename.to_string() }
    }

    pub fn syn_ack(room: &RoomCode, filename: &str, total: u32) -> Self {
        Message::SynAck { room: room.clone(), filename: filename.to_string(), total }
    }

    pub fn error(room: &RoomCode, filename: &str, code: ErrorCode, msg: impl Into<String>) -> Self {
        Message::Error { room: room.clone(), filename: filename.to_string(), code, msg: msg.into() }
    }

    pub fn room(&self) -> &RoomCode {
        match self {
            Message::Syn { room, .. }
            | Message::SynAck { room, .. }
            | Message::Ack { room, .. }
            | Message::Data { room, .. }
            | Message::Download { room, .. }
            | Message::Fin { room, .. }
            | Message::FinAck { room, .. }
            | Message::Error { room, .. } => room,
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            Message::Syn { filename, .. }
            | Message::SynAck { filename, .. }
            | Message::Ack { filename, .. }
            | Message::Data { filename, .. }
            | Message::Download { filename, .. }
            | Message::Fin { filename, .. }
            | Message::FinAck { filename, .. }
            | Message::Error { filename, .. } => filename,
        }
    }

    /// Wire name of the variant, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Syn { .. } => "SYN",
            Message::SynAck { .. } => "SYN-ACK",
            Message::Ack { .. } => "ACK",
            Message::Data { .. } => "DATA",
            Message::Download { .. } => "DOWNLOAD",
            Message::Fin { .. } => "FIN",
            Message::FinAck { .. } => "FIN-ACK",
            Message::Error { .. } => "ERROR",
        }
    }

    /// True for the messages that may create a session on the server
    pub fn is_opening(&self) -> bool {
        matches!(self, Message::Syn { .. } | Message::Download { .. })
    }

    pub fn belongs_to(&self, room: &RoomCode, filename: &str) -> bool {
        self.room() == room && self.filename() == filename
    }

    pub fn session_key(&self, peer: SocketAddr) -> SessionKey {
        SessionKey::new(self.room().clone(), self.filename(), peer)
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        serde_json::to_vec(self).map_err(|e| TransferError::MalformedMessage(e.to_string()))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TransferError> {
        serde_json::from_slice(buf).map_err(|e| TransferError::MalformedMessage(e.to_string()))
    }
}

mod base64_payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomCode {
        "1234".parse().unwrap()
    }

    #[test]
    fn test_data_wire_format() {
        let segment = Segment { seq: 3, total: 7, payload: Bytes::from_static(b"hello") };
        let encoded = Message::data(&room(), "notes.txt", &segment).encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(value["kind"], "DATA");
        assert_eq!(value["room"], "1234");
        assert_eq!(value["filename"], "notes.txt");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["total"], 7);
        assert_eq!(value["payload"], "aGVsbG8=");
    }

    #[test]
    fn test_decode_peer_json() {
        let raw = br#"{"kind":"SYN","room":"0042","filename":"a.bin","total":25,"algo":"reno"}"#;
        let msg = Message::decode(raw).unwrap();
        assert_eq!(
            msg,
            Message::Syn { room: "0042".parse().unwrap(), filename: "a.bin".into(), total: 25, algo: Algorithm::Reno }
        );
        assert!(msg.is_opening());

        let raw = br#"{"kind":"ERROR","room":"0042","filename":"a.bin","code":"FILE_NOT_FOUND","msg":"no such file"}"#;
        assert!(matches!(
            Message::decode(raw).unwrap(),
            Message::Error { code: ErrorCode::FileNotFound, .. }
        ));
    }

    #[test]
    fn test_hyphenated_kinds() {
        let encoded = Message::fin_ack(&room(), "f").encode().unwrap();
        assert!(String::from_utf8(encoded).unwrap().contains(r#""kind":"FIN-ACK""#));
        let encoded = Message::syn_ack(&room(), "f", 2).encode().unwrap();
        assert!(String::from_utf8(encoded).unwrap().contains(r#""kind":"SYN-ACK""#));
    }

    #[test]
    fn test_decode_failures() {
        let cases: [&[u8]; 6] = [
            b"not json",
            br#"{"kind":"PING","room":"1234","filename":"f"}"#,
            br#"{"kind":"ACK","room":"1234","filename":"f","ack":1}"#,
            br#"{"kind":"FIN","room":"12","filename":"f"}"#,
            br#"{"kind":"DATA","room":"1234","filename":"f","seq":1,"total":1,"payload":"***"}"#,
            br#"{"kind":"SYN","room":"1234","filename":"f","total":1,"algo":"cubic"}"#,
        ];
        for raw in cases {
            assert!(
                matches!(Message::decode(raw), Err(TransferError::MalformedMessage(_))),
                "{}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_binary_payload_survives() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let segment = Segment { seq: 1, total: 1, payload: Bytes::from(payload.clone()) };
        let msg = Message::data(&room(), "bin", &segment);
        match Message::decode(&msg.encode().unwrap()).unwrap() {
            Message::Data { payload: decoded, .. } => assert_eq!(decoded.as_ref(), payload.as_slice()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_accessors_and_key() {
        let msg = Message::ack(&room(), "x.txt", 4, 64);
        assert_eq!(msg.kind(), "ACK");
        assert!(msg.belongs_to(&room(), "x.txt"));
        assert!(!msg.belongs_to(&room(), "y.txt"));
        assert!(!msg.is_opening());

        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(msg.session_key(peer), SessionKey::new(room(), "x.txt", peer));
    }
}
