//! Worker node: heartbeat handling plus the main pull loop.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use gradegrid_fabric::{FabricConfig, OnceSlot, Puller, Requester, ShutdownFlag, Subscriber};
use gradegrid_protocol::files;
use gradegrid_protocol::{Envelope, ProtocolError, TestSpec, WorkerConfig};

use crate::executor;
use crate::netip;

/// Connected worker. The heartbeat loop runs on its own task from
/// `connect` onward; `run` owns the pull loop.
///
/// Two latches with different blast radii: `stop` breaks the receive
/// loops once the commander reports done, while `shutdown` also aborts
/// pending request/reply cycles. A done-heartbeat trips only `stop`, so
/// an in-flight assignment still reports its completion before the
/// worker exits.
pub struct Worker {
    config: WorkerConfig,
    stop: ShutdownFlag,
    shutdown: ShutdownFlag,
    finished: Arc<Mutex<bool>>,
    puller: Option<Puller>,
    file_requester: Option<Requester>,
    result_requester: Option<Requester>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl Worker {
    /// Open all five channel endpoints and start answering heartbeats.
    pub async fn connect(config: WorkerConfig) -> Result<Self> {
        let fabric = FabricConfig::new(&config.remote_ip, config.remote_port);

        let subscriber = Subscriber::connect(&fabric.heartbeat_endpoint())
            .await
            .context("connect heartbeat subscriber")?;
        let puller = Puller::connect(&fabric.work_endpoint())
            .await
            .context("connect work puller")?;
        let file_requester = Requester::connect(&fabric.file_endpoint())
            .await
            .context("connect file requester")?;
        let result_requester = Requester::connect(&fabric.results_endpoint())
            .await
            .context("connect result requester")?;
        let liveness_requester = Requester::connect(&fabric.liveness_endpoint())
            .await
            .context("connect heartbeat requester")?;

        info!(
            commander = %format!("{}:{}", config.remote_ip, config.remote_port),
            "connected to commander"
        );

        let stop = ShutdownFlag::new();
        let shutdown = ShutdownFlag::new();
        let finished = Arc::new(Mutex::new(false));
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            subscriber,
            liveness_requester,
            stop.clone(),
            shutdown.clone(),
            Arc::clone(&finished),
            config.ip_echo_url.clone(),
        ));

        Ok(Self {
            config,
            stop,
            shutdown,
            finished,
            puller: Some(puller),
            file_requester: Some(file_requester),
            result_requester: Some(result_requester),
            heartbeat_task: Some(heartbeat_task),
        })
    }

    /// True once a heartbeat carried `done = true`.
    pub fn is_finished(&self) -> bool {
        *self.finished.lock().expect("finished lock poisoned")
    }

    /// Pull and execute assignments until the commander reports done or
    /// the transport fails.
    pub async fn run(&mut self) -> Result<()> {
        let mut puller = self.puller.take().context("worker was already run once")?;
        let mut file_requester = self
            .file_requester
            .take()
            .context("file requester missing")?;
        let mut result_requester = self
            .result_requester
            .take()
            .context("result requester missing")?;

        info!("entering pull loop");
        loop {
            let envelope = match puller.next(&self.stop).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(err) => return Err(err).context("pull loop receive"),
            };
            let Envelope::TestSpec(spec) = envelope else {
                // decode_on(Work) only lets TestSpec through.
                continue;
            };
            match self
                .execute(&mut file_requester, &mut result_requester, spec)
                .await
            {
                Ok(()) => {}
                Err(err @ ProtocolError::Transport(_)) | Err(err @ ProtocolError::Shutdown(_)) => {
                    if self.shutdown.is_set() || self.stop.is_set() {
                        break;
                    }
                    return Err(err).context("assignment aborted by transport failure");
                }
                Err(err) => {
                    // The commander's alarm will re-queue this key.
                    error!(%err, "assignment failed locally");
                }
            }
        }
        info!("pull loop stopped");
        Ok(())
    }

    async fn execute(
        &self,
        file_requester: &mut Requester,
        result_requester: &mut Requester,
        spec: TestSpec,
    ) -> gradegrid_protocol::Result<()> {
        info!(key = %spec.key, commands = spec.commands.len(), "assignment received");

        let reply = file_requester
            .request(
                &Envelope::FileReq {
                    key: spec.key.clone(),
                },
                &self.shutdown,
            )
            .await?;
        let listing = match reply {
            Envelope::Files(listing) => listing,
            other => {
                return Err(ProtocolError::Protocol(format!(
                    "expected a file listing for '{}', got {}",
                    spec.key,
                    other.variant_name()
                )))
            }
        };

        let workdir = self.config.test_dir.join(&spec.key);
        std::fs::create_dir_all(&workdir)?;
        files::materialize(&workdir, &listing)?;
        debug!(key = %spec.key, files = listing.len(), "workspace materialized");

        let verdict = executor::run_commands(&spec.commands, spec.timeout_secs, &workdir).await;
        let results = files::encode_bytes(verdict.report_bytes());

        let ack = result_requester
            .request(
                &Envelope::TestCompletion {
                    key: spec.key.clone(),
                    results,
                },
                &self.shutdown,
            )
            .await?;
        debug!(ack = ack.variant_name(), "completion acknowledged");
        info!(
            key = %spec.key,
            passed = matches!(verdict, executor::Verdict::Passed(_)),
            "assignment reported"
        );
        Ok(())
    }

    /// Stop both loops, abort pending requests, and join the heartbeat
    /// task.
    pub async fn close(&mut self) {
        self.stop.trigger();
        self.shutdown.trigger();
        if let Some(task) = self.heartbeat_task.take() {
            if let Err(err) = task.await {
                warn!(%err, "heartbeat task did not join cleanly");
            }
        }
    }
}

/// Background heartbeat handler: answer every heartbeat with our external
/// IP, and stop the worker's loops when the commander reports done.
async fn heartbeat_loop(
    mut subscriber: Subscriber,
    mut requester: Requester,
    stop: ShutdownFlag,
    shutdown: ShutdownFlag,
    finished: Arc<Mutex<bool>>,
    ip_echo_url: String,
) {
    let cached_ip: OnceSlot<String> = OnceSlot::new();
    loop {
        let envelope = match subscriber.next(&stop).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(err) => {
                error!(%err, "heartbeat channel violation; stopping heartbeats");
                break;
            }
        };
        let Envelope::Heartbeat { time, done } = envelope else {
            continue;
        };
        debug!(time, done, "heartbeat");

        // Respond first so the commander sees us alive even on the final
        // done-heartbeat, then honor the done flag.
        if let Some(ip) = resolve_ip(&cached_ip, &ip_echo_url).await {
            match requester
                .request(&Envelope::HeartbeatResp { ip }, &shutdown)
                .await
            {
                Ok(_ack) => {}
                Err(err) => debug!(%err, "heartbeat response dropped; next period retries"),
            }
        }

        if done {
            info!("commander reports done; shutting down");
            *finished.lock().expect("finished lock poisoned") = true;
            stop.trigger();
            break;
        }
    }
}

/// External IP, resolved once and cached for the life of the worker.
async fn resolve_ip(cache: &OnceSlot<String>, echo_url: &str) -> Option<String> {
    if let Some(ip) = cache.get() {
        return Some(ip);
    }
    let url = echo_url.to_string();
    match tokio::task::spawn_blocking(move || netip::discover(&url)).await {
        Ok(Ok(ip)) => {
            let _ = cache.set(ip.clone());
            Some(ip)
        }
        Ok(Err(err)) => {
            warn!(%err, "external ip lookup failed; skipping heartbeat response");
            None
        }
        Err(err) => {
            warn!(%err, "ip lookup task panicked");
            None
        }
    }
}
