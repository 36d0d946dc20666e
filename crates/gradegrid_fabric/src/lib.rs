//! Role-typed messaging fabric over ZeroMQ.
//!
//! Six socket roles, one wrapper type each, so a requester can never be
//! confused with a pusher at compile time:
//!
//! | Role | Binding | Semantics |
//! |---|---|---|
//! | [`Publisher`] / [`Subscriber`] | publisher binds | 1->N fire-and-forget broadcast |
//! | [`Pusher`] / [`Puller`] | pusher binds | exactly-one-puller-receives per push |
//! | [`Requester`] / [`Responder`] | responder binds | strict alternating request/reply |
//!
//! Receive paths poll with a short timeout and re-check the process-wide
//! [`ShutdownFlag`] between polls, so loops terminate without tearing the
//! socket out from under a pending operation.

pub mod cell;
pub mod flag;
pub mod roles;

pub use cell::OnceSlot;
pub use flag::ShutdownFlag;
pub use roles::{Publisher, Puller, Pusher, Requester, Responder, Subscriber};

/// Port layout for one commander, derived from a base port `P`:
/// `P` heartbeat publisher, `P+1` work pusher, `P+2` file responder,
/// `P+3` result responder, `P+4` heartbeat-response responder.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub host: String,
    pub base_port: u16,
}

impl FabricConfig {
    pub fn new(host: impl Into<String>, base_port: u16) -> Self {
        Self {
            host: host.into(),
            base_port,
        }
    }

    pub fn heartbeat_endpoint(&self) -> String {
        self.endpoint(0)
    }

    pub fn work_endpoint(&self) -> String {
        self.endpoint(1)
    }

    pub fn file_endpoint(&self) -> String {
        self.endpoint(2)
    }

    pub fn results_endpoint(&self) -> String {
        self.endpoint(3)
    }

    pub fn liveness_endpoint(&self) -> String {
        self.endpoint(4)
    }

    fn endpoint(&self, offset: u16) -> String {
        format!("tcp://{}:{}", self.host, self.base_port + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_layout_is_contiguous() {
        let fabric = FabricConfig::new("127.0.0.1", 5000);
        assert_eq!(fabric.heartbeat_endpoint(), "tcp://127.0.0.1:5000");
        assert_eq!(fabric.work_endpoint(), "tcp://127.0.0.1:5001");
        assert_eq!(fabric.file_endpoint(), "tcp://127.0.0.1:5002");
        assert_eq!(fabric.results_endpoint(), "tcp://127.0.0.1:5003");
        assert_eq!(fabric.liveness_endpoint(), "tcp://127.0.0.1:5004");
    }
}
