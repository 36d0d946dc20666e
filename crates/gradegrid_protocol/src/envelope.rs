//! JSON envelopes and channel-aware decoding.

use serde_json::{json, Map, Value};

use crate::error::{ProtocolError, Result};
use crate::files::FilePayload;

/// Pseudo-key that requests the shared grading-harness directory.
pub const COMMON_KEY: &str = "common";

/// One unit of work pushed to a worker. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSpec {
    pub key: String,
    pub timeout_secs: u32,
    pub commands: Vec<String>,
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Periodic broadcast: current POSIX time and the cluster done flag.
    Heartbeat { time: f64, done: bool },
    /// Worker liveness reply carrying its self-reported IP.
    HeartbeatResp { ip: String },
    /// Work assignment.
    TestSpec(TestSpec),
    /// File request for an assignment key (or [`COMMON_KEY`]).
    FileReq { key: String },
    /// Ordered file listing; also doubles as the empty ACK `Files([])`.
    Files(Vec<FilePayload>),
    /// Result report: assignment key plus base64 transcript.
    TestCompletion { key: String, results: String },
}

/// The five logical channels of the fabric, each with a fixed inbound set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Publisher -> subscriber heartbeats.
    Broadcast,
    /// Pusher -> puller work assignments.
    Work,
    /// File-service request side.
    FileService,
    /// Result-ingest request side.
    Results,
    /// Heartbeat-response ingest side.
    Liveness,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Channel::Broadcast => "broadcast",
            Channel::Work => "work",
            Channel::FileService => "file-service",
            Channel::Results => "results",
            Channel::Liveness => "liveness",
        }
    }

    /// Whether an inbound `envelope` is legal on this channel.
    pub fn carries(&self, envelope: &Envelope) -> bool {
        matches!(
            (self, envelope),
            (Channel::Broadcast, Envelope::Heartbeat { .. })
                | (Channel::Work, Envelope::TestSpec(_))
                | (Channel::FileService, Envelope::FileReq { .. })
                | (Channel::Results, Envelope::TestCompletion { .. })
                | (Channel::Liveness, Envelope::HeartbeatResp { .. })
        )
    }
}

impl Envelope {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Envelope::Heartbeat { .. } => "Heartbeat",
            Envelope::HeartbeatResp { .. } => "HeartbeatResp",
            Envelope::TestSpec(_) => "TestSpec",
            Envelope::FileReq { .. } => "FileReq",
            Envelope::Files(_) => "Files",
            Envelope::TestCompletion { .. } => "TestCompletion",
        }
    }

    /// Empty `Files` listing, used as the generic request ACK.
    pub fn ack() -> Envelope {
        Envelope::Files(Vec::new())
    }

    /// Serialize to a single JSON frame.
    pub fn encode(&self) -> Vec<u8> {
        let value = match self {
            Envelope::Heartbeat { time, done } => json!({ "heartbeat": time, "done": done }),
            Envelope::HeartbeatResp { ip } => json!({ "heartbeat_resp": ip }),
            Envelope::TestSpec(spec) => json!({
                "key": &spec.key,
                "timeout": spec.timeout_secs,
                "commands": &spec.commands,
            }),
            Envelope::FileReq { key } => json!({ "files": key }),
            Envelope::Files(listing) => Value::Array(
                listing
                    .iter()
                    .map(|payload| {
                        let mut entry = Map::new();
                        entry.insert(payload.path.clone(), Value::String(payload.data.clone()));
                        Value::Object(entry)
                    })
                    .collect(),
            ),
            Envelope::TestCompletion { key, results } => {
                json!({ "netid": key, "results": results })
            }
        };
        value.to_string().into_bytes()
    }

    /// Parse a frame into whichever variant its shape matches.
    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Protocol(format!("unparseable frame: {e}")))?;
        match value {
            Value::Array(entries) => decode_files(entries),
            Value::Object(fields) => decode_object(fields),
            other => Err(ProtocolError::Protocol(format!(
                "frame is neither object nor array: {other}"
            ))),
        }
    }

    /// Parse a frame arriving on `channel`, rejecting variants the channel
    /// cannot carry.
    pub fn decode_on(channel: Channel, bytes: &[u8]) -> Result<Envelope> {
        let envelope = Envelope::decode(bytes)?;
        if channel.carries(&envelope) {
            Ok(envelope)
        } else {
            Err(ProtocolError::invalid_context(
                envelope.variant_name(),
                channel.name(),
            ))
        }
    }
}

fn decode_files(entries: Vec<Value>) -> Result<Envelope> {
    let mut listing = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Object(fields) = entry else {
            return Err(ProtocolError::Protocol(
                "file entry is not an object".to_string(),
            ));
        };
        if fields.len() != 1 {
            return Err(ProtocolError::Protocol(format!(
                "file entry must hold exactly one path, got {}",
                fields.len()
            )));
        }
        let (path, data) = fields.into_iter().next().expect("len checked above");
        let Value::String(data) = data else {
            return Err(ProtocolError::Protocol(format!(
                "payload for '{path}' is not a string"
            )));
        };
        listing.push(FilePayload { path, data });
    }
    Ok(Envelope::Files(listing))
}

fn decode_object(fields: Map<String, Value>) -> Result<Envelope> {
    if fields.contains_key("heartbeat") {
        let time = f64_field(&fields, "heartbeat")?;
        let done = bool_field(&fields, "done")?;
        return Ok(Envelope::Heartbeat { time, done });
    }
    if fields.contains_key("heartbeat_resp") {
        let ip = string_field(&fields, "heartbeat_resp")?;
        return Ok(Envelope::HeartbeatResp { ip });
    }
    if fields.contains_key("files") {
        let key = string_field(&fields, "files")?;
        return Ok(Envelope::FileReq { key });
    }
    if fields.contains_key("netid") {
        let key = string_field(&fields, "netid")?;
        let results = string_field(&fields, "results")?;
        return Ok(Envelope::TestCompletion { key, results });
    }
    if fields.contains_key("key") {
        let key = string_field(&fields, "key")?;
        let timeout_secs = u32_field(&fields, "timeout")?;
        let commands = command_list(&fields)?;
        return Ok(Envelope::TestSpec(TestSpec {
            key,
            timeout_secs,
            commands,
        }));
    }
    Err(ProtocolError::Protocol(format!(
        "unrecognized frame with fields [{}]",
        fields.keys().cloned().collect::<Vec<_>>().join(", ")
    )))
}

fn string_field(fields: &Map<String, Value>, name: &str) -> Result<String> {
    match fields.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ProtocolError::Protocol(format!(
            "field '{name}' is not a string: {other}"
        ))),
        None => Err(ProtocolError::Protocol(format!("missing field '{name}'"))),
    }
}

fn f64_field(fields: &Map<String, Value>, name: &str) -> Result<f64> {
    fields
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| ProtocolError::Protocol(format!("field '{name}' is not a number")))
}

fn bool_field(fields: &Map<String, Value>, name: &str) -> Result<bool> {
    fields
        .get(name)
        .and_then(Value::as_bool)
        .ok_or_else(|| ProtocolError::Protocol(format!("field '{name}' is not a bool")))
}

fn u32_field(fields: &Map<String, Value>, name: &str) -> Result<u32> {
    let raw = fields
        .get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::Protocol(format!("field '{name}' is not an integer")))?;
    u32::try_from(raw)
        .map_err(|_| ProtocolError::Protocol(format!("field '{name}' does not fit in u32: {raw}")))
}

fn command_list(fields: &Map<String, Value>) -> Result<Vec<String>> {
    let Some(Value::Array(entries)) = fields.get("commands") else {
        return Err(ProtocolError::Protocol(
            "field 'commands' is not an array".to_string(),
        ));
    };
    entries
        .iter()
        .map(|entry| match entry {
            Value::String(s) => Ok(s.clone()),
            other => Err(ProtocolError::Protocol(format!(
                "command entry is not a string: {other}"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: Envelope) {
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn every_variant_roundtrips() {
        roundtrip(Envelope::Heartbeat {
            time: 1_700_000_000.25,
            done: false,
        });
        roundtrip(Envelope::HeartbeatResp {
            ip: "203.0.113.9".to_string(),
        });
        roundtrip(Envelope::TestSpec(TestSpec {
            key: "alice".to_string(),
            timeout_secs: 60,
            commands: vec!["make test".to_string(), "echo done".to_string()],
        }));
        roundtrip(Envelope::FileReq {
            key: COMMON_KEY.to_string(),
        });
        roundtrip(Envelope::Files(vec![
            FilePayload {
                path: "src/main.c".to_string(),
                data: "aGVsbG8=".to_string(),
            },
            FilePayload {
                path: "Makefile".to_string(),
                data: "".to_string(),
            },
        ]));
        roundtrip(Envelope::Files(Vec::new()));
        roundtrip(Envelope::TestCompletion {
            key: "alice".to_string(),
            results: "b2s=".to_string(),
        });
    }

    #[test]
    fn heartbeat_wire_shape_is_stable() {
        let bytes = Envelope::Heartbeat {
            time: 12.5,
            done: true,
        }
        .encode();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["heartbeat"], 12.5);
        assert_eq!(value["done"], true);
    }

    #[test]
    fn completion_uses_netid_field() {
        let bytes = Envelope::TestCompletion {
            key: "bob".to_string(),
            results: "eA==".to_string(),
        }
        .encode();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["netid"], "bob");
        assert_eq!(value["results"], "eA==");
    }

    #[test]
    fn wrong_channel_is_invalid_context() {
        let files = Envelope::ack().encode();
        let err = Envelope::decode_on(Channel::Work, &files).unwrap_err();
        assert!(matches!(err, ProtocolError::Protocol(_)));
        assert!(err.to_string().contains("invalid context"));

        let spec = Envelope::TestSpec(TestSpec {
            key: "k".to_string(),
            timeout_secs: 1,
            commands: vec![],
        })
        .encode();
        assert!(Envelope::decode_on(Channel::Work, &spec).is_ok());
        assert!(Envelope::decode_on(Channel::Broadcast, &spec).is_err());
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(b"42").is_err());
        assert!(Envelope::decode(br#"{"mystery": 1}"#).is_err());
        assert!(Envelope::decode(br#"{"heartbeat": "soon", "done": false}"#).is_err());
        assert!(Envelope::decode(br#"[{"a": "x", "b": "y"}]"#).is_err());
        assert!(Envelope::decode(br#"{"key": "k", "timeout": -1, "commands": []}"#).is_err());
    }
}
