//! The six socket-role wrappers.
//!
//! Each wrapper owns exactly one socket and exposes only its role's
//! operations. `close` is idempotent: the socket is taken out of its slot
//! and dropped, and any later operation reports a shutdown error.

use std::time::Duration;

use tokio::time::timeout;
use zeromq::{
    PubSocket, PullSocket, PushSocket, RepSocket, ReqSocket, Socket, SocketRecv, SocketSend,
    SubSocket, ZmqMessage,
};

use gradegrid_protocol::{Channel, Envelope, ProtocolError, Result};

use crate::flag::ShutdownFlag;
use tracing::{debug, warn};

/// How often receive loops wake to re-check the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn transport_err(during: &str, err: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Transport(format!("{during}: {err}"))
}

/// First frame of a message; multi-frame messages collapse to frame zero
/// because every envelope travels as a single JSON frame.
fn first_frame(message: ZmqMessage) -> Vec<u8> {
    message
        .into_vec()
        .into_iter()
        .next()
        .map(|frame| frame.to_vec())
        .unwrap_or_default()
}

/// Poll `recv` until a frame arrives or the shutdown flag trips.
async fn recv_frame<S: SocketRecv>(
    socket: &mut S,
    shutdown: &ShutdownFlag,
    during: &'static str,
) -> Result<Option<Vec<u8>>> {
    loop {
        if shutdown.is_set() {
            return Ok(None);
        }
        match timeout(POLL_INTERVAL, socket.recv()).await {
            Ok(Ok(message)) => return Ok(Some(first_frame(message))),
            Ok(Err(err)) => return Err(transport_err(during, err)),
            Err(_) => continue,
        }
    }
}

// ============================================================================
// Publisher / Subscriber
// ============================================================================

/// Heartbeat broadcast, commander side. Binds; fire-and-forget sends.
pub struct Publisher {
    socket: Option<PubSocket>,
    endpoint: String,
}

impl Publisher {
    pub async fn bind(endpoint: &str) -> Result<Self> {
        let mut socket = PubSocket::new();
        let bound = socket
            .bind(endpoint)
            .await
            .map_err(|e| transport_err("publisher bind", e))?;
        Ok(Self {
            socket: Some(socket),
            endpoint: bound.to_string(),
        })
    }

    /// The resolved bind endpoint (useful when binding to port 0).
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(ProtocolError::Shutdown("publish"))?;
        socket
            .send(ZmqMessage::from(envelope.encode()))
            .await
            .map_err(|e| transport_err("publish", e))
    }

    pub fn close(&mut self) {
        self.socket.take();
    }
}

/// Heartbeat broadcast, worker side. Connects and subscribes to everything;
/// sees only messages posted after the subscription lands.
pub struct Subscriber {
    socket: Option<SubSocket>,
}

impl Subscriber {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let mut socket = SubSocket::new();
        socket
            .connect(endpoint)
            .await
            .map_err(|e| transport_err("subscriber connect", e))?;
        socket
            .subscribe("")
            .await
            .map_err(|e| transport_err("subscribe", e))?;
        Ok(Self {
            socket: Some(socket),
        })
    }

    /// Next broadcast envelope, or `None` once the shutdown flag trips.
    /// Non-heartbeat traffic on this channel is a protocol violation.
    pub async fn next(&mut self, shutdown: &ShutdownFlag) -> Result<Option<Envelope>> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(ProtocolError::Shutdown("subscribe recv"))?;
        match recv_frame(socket, shutdown, "subscriber recv").await? {
            Some(frame) => Ok(Some(Envelope::decode_on(Channel::Broadcast, &frame)?)),
            None => Ok(None),
        }
    }

    pub fn close(&mut self) {
        self.socket.take();
    }
}

// ============================================================================
// Pusher / Puller
// ============================================================================

/// Work distribution, commander side. Binds; each push lands on exactly one
/// connected puller.
pub struct Pusher {
    socket: Option<PushSocket>,
    endpoint: String,
}

impl Pusher {
    pub async fn bind(endpoint: &str) -> Result<Self> {
        let mut socket = PushSocket::new();
        let bound = socket
            .bind(endpoint)
            .await
            .map_err(|e| transport_err("pusher bind", e))?;
        Ok(Self {
            socket: Some(socket),
            endpoint: bound.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Hand the envelope to exactly one puller. Classic ZMQ push blocks
    /// until a peer exists; this transport errors instead, so retry until
    /// a puller accepts the message or shutdown trips.
    pub async fn push(&mut self, envelope: &Envelope, shutdown: &ShutdownFlag) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(ProtocolError::Shutdown("push"))?;
        let frame = envelope.encode();
        let mut reported = false;
        loop {
            if shutdown.is_set() {
                return Err(ProtocolError::Shutdown("push"));
            }
            match socket.send(ZmqMessage::from(frame.clone())).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if !reported {
                        debug!(%err, "push waiting for a connected puller");
                        reported = true;
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.socket.take();
    }
}

/// Work distribution, worker side.
pub struct Puller {
    socket: Option<PullSocket>,
}

impl Puller {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let mut socket = PullSocket::new();
        socket
            .connect(endpoint)
            .await
            .map_err(|e| transport_err("puller connect", e))?;
        Ok(Self {
            socket: Some(socket),
        })
    }

    /// Next assignment, or `None` once the shutdown flag trips. Anything
    /// other than a `TestSpec` on this channel is a protocol violation.
    pub async fn next(&mut self, shutdown: &ShutdownFlag) -> Result<Option<Envelope>> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(ProtocolError::Shutdown("pull recv"))?;
        match recv_frame(socket, shutdown, "puller recv").await? {
            Some(frame) => Ok(Some(Envelope::decode_on(Channel::Work, &frame)?)),
            None => Ok(None),
        }
    }

    pub fn close(&mut self) {
        self.socket.take();
    }
}

// ============================================================================
// Requester / Responder
// ============================================================================

/// Request/reply, requesting side. Connects; every `request` blocks until
/// the single reply arrives or shutdown trips.
pub struct Requester {
    socket: Option<ReqSocket>,
}

impl Requester {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let mut socket = ReqSocket::new();
        socket
            .connect(endpoint)
            .await
            .map_err(|e| transport_err("requester connect", e))?;
        Ok(Self {
            socket: Some(socket),
        })
    }

    pub async fn request(
        &mut self,
        envelope: &Envelope,
        shutdown: &ShutdownFlag,
    ) -> Result<Envelope> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(ProtocolError::Shutdown("request"))?;
        socket
            .send(ZmqMessage::from(envelope.encode()))
            .await
            .map_err(|e| transport_err("request send", e))?;
        match recv_frame(socket, shutdown, "request recv").await? {
            Some(frame) => Envelope::decode(&frame),
            None => Err(ProtocolError::Shutdown("request recv")),
        }
    }

    pub fn close(&mut self) {
        self.socket.take();
    }
}

/// Request/reply, serving side. Binds; `serve` replies exactly once per
/// request by construction (the handler returns the reply envelope).
pub struct Responder {
    socket: Option<RepSocket>,
    channel: Channel,
    endpoint: String,
}

impl Responder {
    pub async fn bind(endpoint: &str, channel: Channel) -> Result<Self> {
        let mut socket = RepSocket::new();
        let bound = socket
            .bind(endpoint)
            .await
            .map_err(|e| transport_err("responder bind", e))?;
        Ok(Self {
            socket: Some(socket),
            channel,
            endpoint: bound.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Serve until the shutdown flag trips.
    ///
    /// The handler only ever sees envelopes this responder's channel can
    /// carry; undecodable frames and off-channel variants are ACKed with
    /// an empty `Files` listing and dropped.
    pub async fn serve<F>(&mut self, shutdown: &ShutdownFlag, mut handler: F) -> Result<()>
    where
        F: FnMut(Envelope) -> Envelope,
    {
        let channel = self.channel;
        let socket = self
            .socket
            .as_mut()
            .ok_or(ProtocolError::Shutdown("serve"))?;
        loop {
            let Some(frame) = recv_frame(socket, shutdown, "responder recv").await? else {
                return Ok(());
            };
            let reply = match Envelope::decode(&frame) {
                Ok(envelope) if channel.carries(&envelope) => handler(envelope),
                Ok(envelope) => {
                    debug!(
                        channel = channel.name(),
                        variant = envelope.variant_name(),
                        "dropping off-channel request"
                    );
                    Envelope::ack()
                }
                Err(err) => {
                    warn!(channel = channel.name(), %err, "dropping unparseable request");
                    Envelope::ack()
                }
            };
            socket
                .send(ZmqMessage::from(reply.encode()))
                .await
                .map_err(|e| transport_err("responder send", e))?;
        }
    }

    pub fn close(&mut self) {
        self.socket.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradegrid_protocol::{FilePayload, TestSpec};

    #[tokio::test]
    async fn request_reply_roundtrip() {
        let shutdown = ShutdownFlag::new();
        let mut responder = Responder::bind("tcp://127.0.0.1:0", Channel::FileService)
            .await
            .unwrap();
        let endpoint = responder.endpoint().to_string();

        let serve_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            responder
                .serve(&serve_shutdown, |envelope| match envelope {
                    Envelope::FileReq { key } => Envelope::Files(vec![FilePayload {
                        path: format!("{key}.txt"),
                        data: "b2s=".to_string(),
                    }]),
                    _ => Envelope::ack(),
                })
                .await
                .unwrap();
        });

        let mut requester = Requester::connect(&endpoint).await.unwrap();
        let reply = requester
            .request(
                &Envelope::FileReq {
                    key: "alice".to_string(),
                },
                &shutdown,
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            Envelope::Files(vec![FilePayload {
                path: "alice.txt".to_string(),
                data: "b2s=".to_string(),
            }])
        );

        // Off-channel traffic gets the empty ACK.
        let reply = requester
            .request(
                &Envelope::TestCompletion {
                    key: "alice".to_string(),
                    results: "eA==".to_string(),
                },
                &shutdown,
            )
            .await
            .unwrap();
        assert_eq!(reply, Envelope::ack());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("serve should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn publish_subscribe_delivers_heartbeats() {
        let shutdown = ShutdownFlag::new();
        let mut publisher = Publisher::bind("tcp://127.0.0.1:0").await.unwrap();
        let endpoint = publisher.endpoint().to_string();
        let mut subscriber = Subscriber::connect(&endpoint).await.unwrap();

        let send_shutdown = shutdown.clone();
        let feeder = tokio::spawn(async move {
            while !send_shutdown.is_set() {
                publisher
                    .send(&Envelope::Heartbeat {
                        time: 1.0,
                        done: false,
                    })
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let received = tokio::time::timeout(Duration::from_secs(5), subscriber.next(&shutdown))
            .await
            .expect("heartbeat should arrive")
            .unwrap();
        assert!(matches!(
            received,
            Some(Envelope::Heartbeat { done: false, .. })
        ));

        shutdown.trigger();
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn push_pull_delivers_specs() {
        let shutdown = ShutdownFlag::new();
        let mut pusher = Pusher::bind("tcp://127.0.0.1:0").await.unwrap();
        let endpoint = pusher.endpoint().to_string();
        let mut puller = Puller::connect(&endpoint).await.unwrap();

        let spec = TestSpec {
            key: "alice".to_string(),
            timeout_secs: 30,
            commands: vec!["echo hi".to_string()],
        };
        pusher
            .push(&Envelope::TestSpec(spec.clone()), &shutdown)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), puller.next(&shutdown))
            .await
            .expect("spec should arrive")
            .unwrap();
        assert_eq!(received, Some(Envelope::TestSpec(spec)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_operations_report_shutdown() {
        let mut publisher = Publisher::bind("tcp://127.0.0.1:0").await.unwrap();
        publisher.close();
        publisher.close();
        let err = publisher
            .send(&Envelope::Heartbeat {
                time: 0.0,
                done: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Shutdown(_)));
    }
}
