//! Wire protocol for Commander <-> Worker communication.
//!
//! Every frame on the fabric is a single JSON object (or, for file
//! listings, a JSON array). The recognized variants:
//!
//! ```text
//! {"heartbeat": <f64-unix-time>, "done": <bool>}     Commander -> Worker (pub)
//! {"heartbeat_resp": "<ip>"}                         Worker -> Commander (req)
//! {"key": "...", "timeout": <u32>, "commands": []}   Commander -> Worker (push)
//! {"files": "<key>"}                                 Worker -> Commander (req)
//! [{"<path>": "<b64>"}, ...]                         Commander -> Worker (resp)
//! {"netid": "<key>", "results": "<b64>"}             Worker -> Commander (req)
//! ```
//!
//! Decoding is channel-aware: a variant arriving on a channel that cannot
//! carry it is rejected with [`ProtocolError::Protocol`].

pub mod config;
pub mod envelope;
pub mod error;
pub mod files;

pub use config::{CommanderConfig, WorkerConfig};
pub use envelope::{Channel, Envelope, TestSpec, COMMON_KEY};
pub use error::{ProtocolError, Result};
pub use files::FilePayload;
