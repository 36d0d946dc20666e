//! The commander engine: five concurrent service loops plus one alarm task
//! per dispatched assignment.
//!
//! Service tasks own their sockets outright; nothing else touches them.
//! Shared state is limited to the registry, the liveness tracker, the
//! shutdown flag, and the user hooks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use gradegrid_fabric::{FabricConfig, OnceSlot, Publisher, Pusher, Responder, ShutdownFlag};
use gradegrid_protocol::files;
use gradegrid_protocol::{Channel, CommanderConfig, Envelope, TestSpec, COMMON_KEY};

use crate::liveness::{current_time, LivenessTracker};
use crate::registry::AssignmentRegistry;

/// User observation callback, keyed by assignment key or worker IP.
pub type Hook = Arc<dyn Fn(&str) + Send + Sync>;

fn noop_hook() -> Hook {
    Arc::new(|_| {})
}

/// Observation channel for the embedding application. Every hook defaults
/// to a no-op.
#[derive(Clone)]
pub struct Hooks {
    pub on_success: Hook,
    pub on_failure: Hook,
    pub on_client_connected: Hook,
    pub on_client_timeout: Hook,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            on_success: noop_hook(),
            on_failure: noop_hook(),
            on_client_connected: noop_hook(),
            on_client_timeout: noop_hook(),
        }
    }
}

/// One long-running service loop and its terminal-status cell.
struct Service {
    name: &'static str,
    handle: JoinHandle<()>,
    failure: Arc<OnceSlot<String>>,
}

/// The five service handles, kept separately so no loop can shadow
/// another's lifecycle.
struct ServiceSet {
    heartbeat_publisher: Service,
    heartbeat_responder: Service,
    work_pusher: Service,
    file_responder: Service,
    result_responder: Service,
}

impl ServiceSet {
    fn iter(&self) -> [&Service; 5] {
        [
            &self.heartbeat_publisher,
            &self.heartbeat_responder,
            &self.work_pusher,
            &self.file_responder,
            &self.result_responder,
        ]
    }

    fn into_array(self) -> [Service; 5] {
        [
            self.heartbeat_publisher,
            self.heartbeat_responder,
            self.work_pusher,
            self.file_responder,
            self.result_responder,
        ]
    }
}

struct Sockets {
    publisher: Publisher,
    pusher: Pusher,
    file_responder: Responder,
    result_responder: Responder,
    liveness_responder: Responder,
}

pub struct Commander {
    config: CommanderConfig,
    commands: Arc<Vec<String>>,
    registry: Arc<AssignmentRegistry>,
    live: Arc<LivenessTracker>,
    hooks: Hooks,
    shutdown: ShutdownFlag,
    sockets: Option<Sockets>,
    services: Option<ServiceSet>,
}

impl Commander {
    /// Bind the five sockets, seed the registry from the submission
    /// directory, and load the command list.
    pub async fn make(config: CommanderConfig, hooks: Hooks) -> Result<Self> {
        let fabric = FabricConfig::new(&config.bind_host, config.base_port);
        let publisher = Publisher::bind(&fabric.heartbeat_endpoint())
            .await
            .context("bind heartbeat publisher")?;
        let pusher = Pusher::bind(&fabric.work_endpoint())
            .await
            .context("bind work pusher")?;
        let file_responder = Responder::bind(&fabric.file_endpoint(), Channel::FileService)
            .await
            .context("bind file responder")?;
        let result_responder = Responder::bind(&fabric.results_endpoint(), Channel::Results)
            .await
            .context("bind result responder")?;
        let liveness_responder = Responder::bind(&fabric.liveness_endpoint(), Channel::Liveness)
            .await
            .context("bind heartbeat responder")?;

        let keys = scan_assignments(&config.test_dir)
            .with_context(|| format!("scan submissions in {}", config.test_dir.display()))?;
        warn_about_stale_results(&config.results_dir, &keys);
        let commands = files::read_lines(&config.command_file)
            .with_context(|| format!("read command file {}", config.command_file.display()))?;
        if commands.is_empty() {
            warn!("command file is empty; assignments will pass vacuously");
        }
        info!(
            assignments = keys.len(),
            commands = commands.len(),
            base_port = config.base_port,
            "commander ready"
        );

        Ok(Self {
            config,
            commands: Arc::new(commands),
            registry: Arc::new(AssignmentRegistry::new(keys)),
            live: Arc::new(LivenessTracker::new()),
            hooks,
            shutdown: ShutdownFlag::new(),
            sockets: Some(Sockets {
                publisher,
                pusher,
                file_responder,
                result_responder,
                liveness_responder,
            }),
            services: None,
        })
    }

    pub fn registry(&self) -> &Arc<AssignmentRegistry> {
        &self.registry
    }

    pub fn liveness(&self) -> &Arc<LivenessTracker> {
        &self.live
    }

    /// Start the five service loops, then block until every assignment is
    /// terminal, shutdown is requested, or a service dies. Returns the
    /// first surfaced service error, if any.
    pub async fn run(&mut self) -> Result<()> {
        let sockets = self
            .sockets
            .take()
            .context("commander was already run once")?;
        let wake = Arc::new(Notify::new());

        let services = ServiceSet {
            heartbeat_publisher: spawn_service(
                "heartbeat-publisher",
                Arc::clone(&wake),
                heartbeat_publisher(
                    sockets.publisher,
                    Arc::clone(&self.registry),
                    Arc::clone(&self.live),
                    self.hooks.on_client_timeout.clone(),
                    self.shutdown.clone(),
                    self.config.client_timeout,
                ),
            ),
            heartbeat_responder: spawn_service(
                "heartbeat-responder",
                Arc::clone(&wake),
                heartbeat_responder(
                    sockets.liveness_responder,
                    Arc::clone(&self.live),
                    self.hooks.on_client_connected.clone(),
                    self.shutdown.clone(),
                ),
            ),
            work_pusher: spawn_service(
                "work-pusher",
                Arc::clone(&wake),
                work_pusher(
                    sockets.pusher,
                    Arc::clone(&self.registry),
                    Arc::clone(&self.commands),
                    self.hooks.on_failure.clone(),
                    self.shutdown.clone(),
                    self.config.test_timeout,
                    self.config.client_timeout,
                ),
            ),
            file_responder: spawn_service(
                "file-responder",
                Arc::clone(&wake),
                file_responder(
                    sockets.file_responder,
                    self.config.test_dir.clone(),
                    self.config.common_dir.clone(),
                    self.shutdown.clone(),
                ),
            ),
            result_responder: spawn_service(
                "result-responder",
                Arc::clone(&wake),
                result_responder(
                    sockets.result_responder,
                    Arc::clone(&self.registry),
                    self.config.results_dir.clone(),
                    self.hooks.on_success.clone(),
                    self.shutdown.clone(),
                ),
            ),
        };

        let outcome = loop {
            // Register for failure wakeups before checking, so a service
            // dying between the check and the await still wakes us.
            let failed = wake.notified();
            if let Some((name, message)) = first_failure(&services) {
                break Err(anyhow::anyhow!("service {name} failed: {message}"));
            }
            if self.registry.done() || self.shutdown.is_set() {
                break Ok(());
            }
            tokio::select! {
                _ = self.registry.wait_for_done() => {}
                _ = self.shutdown.wait() => {}
                _ = failed => {}
            }
        };

        self.services = Some(services);
        let counts = self.registry.counts();
        info!(
            finished = counts.finished,
            exhausted = counts.exhausted,
            total = counts.total,
            "commander run complete"
        );
        outcome
    }

    /// Linger long enough for the final done-heartbeat to propagate, then
    /// stop every service loop.
    pub async fn close(mut self) {
        let linger = Duration::from_secs(2 * u64::from(self.config.client_timeout));
        tokio::time::sleep(linger).await;
        self.shutdown.trigger();
        if let Some(services) = self.services.take() {
            for service in services.into_array() {
                if let Err(err) = service.handle.await {
                    warn!(service = service.name, %err, "service task did not join cleanly");
                }
            }
        }
    }
}

fn first_failure(services: &ServiceSet) -> Option<(&'static str, String)> {
    services
        .iter()
        .into_iter()
        .find_map(|service| service.failure.get().map(|msg| (service.name, msg)))
}

fn spawn_service(
    name: &'static str,
    wake: Arc<Notify>,
    body: impl std::future::Future<Output = Result<()>> + Send + 'static,
) -> Service {
    let failure = Arc::new(OnceSlot::new());
    let slot = Arc::clone(&failure);
    let handle = tokio::spawn(async move {
        match body.await {
            Ok(()) => debug!(service = name, "service loop stopped"),
            Err(err) => {
                error!(service = name, error = %format!("{err:#}"), "service loop died");
                let _ = slot.set(format!("{err:#}"));
                wake.notify_waiters();
            }
        }
    });
    Service {
        name,
        handle,
        failure,
    }
}

/// Immediate subdirectories of the submission root become assignment keys.
fn scan_assignments(test_dir: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for entry in std::fs::read_dir(test_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == COMMON_KEY {
            warn!("submission directory '{COMMON_KEY}' collides with the shared-files key; skipping");
            continue;
        }
        keys.push(name);
    }
    Ok(keys)
}

/// Result files carry the assignment key as their basename; anything left
/// over from an earlier run will be overwritten once that key finishes.
fn warn_about_stale_results(results_dir: &Path, keys: &[String]) {
    let Ok(entries) = std::fs::read_dir(results_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let key = files::strip_extension(&name.to_string_lossy()).to_string();
        if keys.contains(&key) {
            warn!(key = %key, "stale result from a previous run will be overwritten");
        }
    }
}

fn looks_like_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('/') && !key.contains('\\') && key != "." && key != ".."
}

// ============================================================================
// Service loops
// ============================================================================

/// Publish `Heartbeat(now, done)` every `client_timeout` seconds and evict
/// workers that missed a whole period.
async fn heartbeat_publisher(
    mut publisher: Publisher,
    registry: Arc<AssignmentRegistry>,
    live: Arc<LivenessTracker>,
    on_client_timeout: Hook,
    shutdown: ShutdownFlag,
    client_timeout: u32,
) -> Result<()> {
    let period = Duration::from_secs(u64::from(client_timeout));
    loop {
        if shutdown.is_set() {
            return Ok(());
        }
        let done = registry.done();
        publisher
            .send(&Envelope::Heartbeat {
                time: current_time(),
                done,
            })
            .await
            .context("publish heartbeat")?;
        live.cleanup(f64::from(client_timeout), |ip| {
            warn!(ip, "worker missed its heartbeat window");
            on_client_timeout(ip);
        });
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.wait() => return Ok(()),
        }
    }
}

/// ACK every heartbeat response and refresh the sender's liveness entry.
async fn heartbeat_responder(
    mut responder: Responder,
    live: Arc<LivenessTracker>,
    on_client_connected: Hook,
    shutdown: ShutdownFlag,
) -> Result<()> {
    responder
        .serve(&shutdown, |envelope| {
            if let Envelope::HeartbeatResp { ip } = envelope {
                live.add_ip(&ip, |ip| {
                    info!(ip, "worker connected");
                    on_client_connected(ip);
                });
            }
            Envelope::ack()
        })
        .await
        .context("heartbeat responder")
}

/// Dispatch pending keys and arm one alarm per dispatch.
async fn work_pusher(
    mut pusher: Pusher,
    registry: Arc<AssignmentRegistry>,
    commands: Arc<Vec<String>>,
    on_failure: Hook,
    shutdown: ShutdownFlag,
    test_timeout: u32,
    client_timeout: u32,
) -> Result<()> {
    let idle_wait = Duration::from_millis(200);
    loop {
        if shutdown.is_set() {
            return Ok(());
        }
        let key = match registry.pop_next() {
            Some(key) => key,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(idle_wait) => {}
                    _ = shutdown.wait() => return Ok(()),
                }
                continue;
            }
        };
        registry.mark_assigned(&key);
        registry.refresh_done();

        let spec = TestSpec {
            key: key.clone(),
            timeout_secs: test_timeout,
            commands: commands.as_ref().clone(),
        };
        match pusher.push(&Envelope::TestSpec(spec), &shutdown).await {
            Ok(()) => {}
            Err(gradegrid_protocol::ProtocolError::Shutdown(_)) => return Ok(()),
            Err(err) => return Err(err).with_context(|| format!("push assignment '{key}'")),
        }
        info!(key = %key, attempt = registry.attempts_for(&key), "assignment dispatched");

        spawn_alarm(
            key,
            Arc::clone(&registry),
            on_failure.clone(),
            shutdown.clone(),
            client_timeout,
        );
    }
}

/// One-shot give-up timer for a single dispatch. The deadline is the
/// client timeout, not the test timeout: this is when the commander stops
/// waiting on the worker, not when the worker would kill the test.
fn spawn_alarm(
    key: String,
    registry: Arc<AssignmentRegistry>,
    on_failure: Hook,
    shutdown: ShutdownFlag,
    client_timeout: u32,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(u64::from(client_timeout))) => {}
            _ = shutdown.wait() => return,
        }
        if registry.on_timeout(&key) {
            warn!(
                key = %key,
                attempts = registry.attempts_for(&key),
                "no result within the client timeout; assignment re-queued"
            );
            on_failure(&key);
        }
    });
}

/// Serve submission trees and the shared grading harness.
async fn file_responder(
    mut responder: Responder,
    test_dir: PathBuf,
    common_dir: PathBuf,
    shutdown: ShutdownFlag,
) -> Result<()> {
    responder
        .serve(&shutdown, |envelope| {
            let Envelope::FileReq { key } = envelope else {
                return Envelope::ack();
            };
            let dir = if key == COMMON_KEY {
                common_dir.clone()
            } else if looks_like_key(&key) {
                test_dir.join(&key)
            } else {
                warn!(key = %key, "refusing malformed file request key");
                return Envelope::ack();
            };
            match files::collect_dir(&dir) {
                Ok(listing) => {
                    debug!(key = %key, files = listing.len(), "served file request");
                    Envelope::Files(listing)
                }
                Err(err) => {
                    // The worker will be re-queued by the alarm; an empty
                    // listing keeps the reply cycle intact.
                    warn!(key = %key, %err, "file request failed");
                    Envelope::ack()
                }
            }
        })
        .await
        .context("file responder")
}

/// Persist transcripts and mark assignments finished.
async fn result_responder(
    mut responder: Responder,
    registry: Arc<AssignmentRegistry>,
    results_dir: PathBuf,
    on_success: Hook,
    shutdown: ShutdownFlag,
) -> Result<()> {
    responder
        .serve(&shutdown, |envelope| {
            let Envelope::TestCompletion { key, results } = envelope else {
                return Envelope::ack();
            };
            if !looks_like_key(&key) {
                warn!(key = %key, "refusing malformed completion key");
                return Envelope::ack();
            }
            let bytes = match files::decode_str(&results) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(key = %key, %err, "completion payload is not base64; leaving key unfinished");
                    return Envelope::ack();
                }
            };
            match persist_result(&results_dir, &key, &bytes) {
                Ok(path) => {
                    info!(key = %key, path = %path.display(), bytes = bytes.len(), "result recorded");
                    registry.on_result(&key);
                    on_success(&key);
                }
                Err(err) => {
                    // Leave the key unfinished; the alarm path will demote
                    // it through the normal retry machinery.
                    warn!(key = %key, %err, "failed to persist result");
                }
            }
            Envelope::ack()
        })
        .await
        .context("result responder")
}

fn persist_result(results_dir: &Path, key: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(results_dir)?;
    let path = results_dir.join(format!("{key}.txt"));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_sanity_filter() {
        assert!(looks_like_key("alice"));
        assert!(looks_like_key("net_id-42"));
        assert!(!looks_like_key(""));
        assert!(!looks_like_key(".."));
        assert!(!looks_like_key("a/b"));
        assert!(!looks_like_key("a\\b"));
    }

    #[test]
    fn scan_assignments_skips_files_and_common() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("alice")).unwrap();
        std::fs::create_dir(dir.path().join("bob")).unwrap();
        std::fs::create_dir(dir.path().join("common")).unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let mut keys = scan_assignments(dir.path()).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["alice".to_string(), "bob".to_string()]);
    }
}
