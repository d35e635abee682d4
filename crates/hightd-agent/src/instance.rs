use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};

use crate::docker::{ContainerDriver, ContainerSpec, UsageSnapshot, reduce_stats};
use crate::live_events::{EventCategory, LiveEventBus, LiveSubscription, LiveEvent};
use crate::log_stream::{self, LogStream};
use crate::sandbox;
use crate::start_spec::{self, StartData};

/// Managed containers are named `hightd-{server id}`; reconciliation and
/// creation must agree on this.
pub const CONTAINER_PREFIX: &str = "hightd-";

const START_POLL_ATTEMPTS: u32 = 15;
const START_POLL_INTERVAL: Duration = Duration::from_millis(200);
const STOP_POLL_ATTEMPTS: u32 = 8;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub const MSG_RUNNING: &str = "Servidor em execução.";
pub const MSG_STOPPED: &str = "Servidor marcado como desligado";
const MSG_STOPPING: &str = "Parando servidor...";
const MSG_START_TIMEOUT: &str = "O servidor não atingiu o estado de execução a tempo.";

type StdinSink = Pin<Box<dyn AsyncWrite + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
        }
    }
}

#[derive(Default)]
struct InstanceState {
    /// Name of the container currently owned by this instance, if any.
    container: Option<String>,
    running: bool,
    started_at: Option<i64>,
    stdin: Option<StdinSink>,
    /// Bumped whenever the container handle is replaced so stale wait
    /// watchers cannot clobber a newer container's state.
    generation: u64,
}

/// The lifecycle state machine for one server. Lifecycle actions (start,
/// stop, restart, delete, adopt) are serialized by `lifecycle`; field reads
/// and stdin writes go through the short-lived `state` lock.
pub struct ServerInstance {
    id: String,
    dir: PathBuf,
    docker: ContainerDriver,
    events: LiveEventBus,
    state: Mutex<InstanceState>,
    lifecycle: Mutex<()>,
}

impl ServerInstance {
    pub fn new(id: impl Into<String>, dir: PathBuf, docker: ContainerDriver) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            dir,
            docker,
            events: LiveEventBus::new(),
            state: Mutex::new(InstanceState::default()),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn container_name(&self) -> String {
        format!("{CONTAINER_PREFIX}{}", self.id)
    }

    pub fn subscribe(&self) -> (LiveSubscription, mpsc::UnboundedReceiver<LiveEvent>) {
        self.events.subscribe()
    }

    pub fn emit(&self, category: EventCategory, message: impl Into<String>) {
        self.events.emit(category, message);
    }

    /// `(running, started_at)` snapshot of the in-memory fields, without
    /// consulting the runtime.
    pub async fn snapshot(&self) -> (bool, Option<i64>) {
        let state = self.state.lock().await;
        (state.running, state.started_at)
    }

    /// Adopt a container the runtime already holds (boot reconciliation).
    pub async fn adopt(self: &Arc<Self>, started_at: Option<i64>) {
        let _guard = self.lifecycle.lock().await;
        let name = self.container_name();
        let generation = {
            let mut state = self.state.lock().await;
            state.container = Some(name.clone());
            state.running = true;
            state.started_at = Some(started_at.unwrap_or_else(now_ms));
            state.generation += 1;
            state.generation
        };
        if let Err(err) = self.attach_stdio().await {
            tracing::warn!(server = %self.id, %err, "reattach after reconcile failed");
        }
        self.spawn_wait_watcher(generation);
    }

    pub async fn start(self: &Arc<Self>, data: &StartData) -> anyhow::Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.do_start(data).await
    }

    pub async fn stop(self: &Arc<Self>, command: &str) {
        let _guard = self.lifecycle.lock().await;
        self.do_stop(command).await;
    }

    pub async fn restart(self: &Arc<Self>, data: &StartData) -> anyhow::Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.do_stop(&data.core.stop_command).await;
        self.do_start(data).await
    }

    /// Ask the runtime to kill the container. Never raises; killing an
    /// already-stopped instance is a no-op.
    pub async fn kill(&self) {
        let name = self.container_name();
        if let Err(err) = self.docker.kill(&name).await {
            tracing::debug!(server = %self.id, %err, "kill was a no-op");
        }
    }

    /// Tear the instance down: best-effort kill, force-remove the
    /// container, clear all in-memory state and remove the sandbox
    /// directory. Deregistration is the registry's job.
    pub async fn delete(self: &Arc<Self>) -> anyhow::Result<()> {
        let _guard = self.lifecycle.lock().await;
        let name = self.container_name();

        self.kill().await;
        if let Err(err) = self.docker.remove(&name, true).await {
            tracing::debug!(server = %self.id, %err, "container removal was a no-op");
        }

        {
            let mut state = self.state.lock().await;
            state.container = None;
            state.running = false;
            state.started_at = None;
            state.stdin = None;
            state.generation += 1;
        }
        self.events.clear();

        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("remove server directory {}", self.dir.display())
            }),
        }
    }

    /// Write one command to the server's stdin. When the sink is missing or
    /// went stale, one reattach is attempted before failing.
    pub async fn send_command(&self, command: &str) -> anyhow::Result<()> {
        let mut line = command.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        if self.try_write(line.as_bytes()).await.is_ok() {
            return Ok(());
        }

        self.attach_stdio()
            .await
            .context("stdin unavailable: reattach failed")?;
        self.try_write(line.as_bytes())
            .await
            .context("stdin unavailable")
    }

    /// Authoritative status: inspects the runtime and synchronizes the
    /// in-memory fields with what it reports. An inspect failure counts as
    /// stopped and drops the container handle.
    pub async fn status(&self) -> InstanceStatus {
        let name = self.container_name();
        match self.docker.inspect(&name).await {
            Ok(snap) => {
                let mut state = self.state.lock().await;
                state.container = Some(name);
                state.running = snap.running;
                if snap.running {
                    if state.started_at.is_none() {
                        state.started_at =
                            Some(parse_runtime_time(snap.started_at.as_deref()).unwrap_or_else(now_ms));
                    }
                    InstanceStatus::Running
                } else {
                    state.started_at = None;
                    InstanceStatus::Stopped
                }
            }
            Err(err) => {
                tracing::debug!(server = %self.id, %err, "inspect failed; treating as stopped");
                let mut state = self.state.lock().await;
                state.container = None;
                state.running = false;
                state.started_at = None;
                InstanceStatus::Stopped
            }
        }
    }

    /// One-shot resource snapshot.
    pub async fn usages(&self) -> anyhow::Result<UsageSnapshot> {
        let stats = self.docker.stats(&self.container_name()).await?;
        Ok(reduce_stats(&stats))
    }

    /// Start following container logs; lines are delivered in arrival
    /// order. The returned handle's cleanup is idempotent.
    pub fn stream_logs(&self, tail: u32, lines: mpsc::UnboundedSender<String>) -> LogStream {
        let stream = self.docker.logs(&self.container_name(), tail, true);
        log_stream::follow(stream, lines)
    }

    async fn do_start(self: &Arc<Self>, data: &StartData) -> anyhow::Result<()> {
        let name = self.container_name();
        let rendered = start_spec::render(data);

        // A pre-existing container (failed start, runtime leftovers) is
        // force-removed before anything else.
        if let Err(err) = self.docker.remove(&name, true).await {
            tracing::debug!(server = %self.id, %err, "no previous container to remove");
        }
        {
            let mut state = self.state.lock().await;
            state.container = None;
            state.running = false;
            state.started_at = None;
            state.stdin = None;
            state.generation += 1;
        }

        match self.create_and_run(data, &rendered, &name).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.events.emit(EventCategory::Error, err.to_string());
                if let Err(remove_err) = self.docker.remove(&name, true).await {
                    tracing::debug!(server = %self.id, %remove_err, "rollback removal was a no-op");
                }
                let mut state = self.state.lock().await;
                state.container = None;
                state.running = false;
                state.started_at = None;
                state.stdin = None;
                state.generation += 1;
                Err(err)
            }
        }
    }

    async fn create_and_run(
        self: &Arc<Self>,
        data: &StartData,
        rendered: &start_spec::RenderedStart,
        name: &str,
    ) -> anyhow::Result<()> {
        self.write_config_files(&rendered.config_files).await?;

        let events = &self.events;
        self.docker
            .pull(&data.image, |p| {
                let message = match &p.progress {
                    Some(progress) => format!("{} {} {}", p.reference, p.status, progress),
                    None => format!("{} {}", p.reference, p.status),
                };
                events.emit(EventCategory::Pull, message.trim().to_string());
            })
            .await?;

        let allocations = data.all_allocations();
        let spec = ContainerSpec {
            name,
            image: &data.image,
            command: &rendered.command,
            env: data.container_env(),
            memory_mib: data.memory,
            cpu: data.cpu,
            sandbox_dir: &self.dir,
            allocations: &allocations,
        };
        self.docker.create(&spec).await?;
        self.docker.start(name).await?;

        let generation = {
            let mut state = self.state.lock().await;
            state.container = Some(name.to_string());
            state.generation += 1;
            state.generation
        };

        let mut running = false;
        for _ in 0..START_POLL_ATTEMPTS {
            tokio::time::sleep(START_POLL_INTERVAL).await;
            if let Ok(snap) = self.docker.inspect(name).await
                && snap.running
            {
                running = true;
                break;
            }
        }

        if running {
            let mut state = self.state.lock().await;
            state.running = true;
            state.started_at = Some(now_ms());
            drop(state);
            self.events.emit(EventCategory::Status, MSG_RUNNING);
        } else {
            self.events.emit(EventCategory::Error, MSG_START_TIMEOUT);
        }

        // Attach failure after a successful start leaves the server running
        // without a command channel; commands then fail until a reattach
        // succeeds.
        if let Err(err) = self.attach_stdio().await {
            tracing::warn!(server = %self.id, %err, "stdio attach failed");
        }

        self.spawn_wait_watcher(generation);
        Ok(())
    }

    async fn do_stop(self: &Arc<Self>, command: &str) {
        self.events.emit(EventCategory::Status, MSG_STOPPING);

        if command.trim().is_empty() || self.send_command(command).await.is_err() {
            self.kill().await;
            return;
        }

        // The stop command went out; give the server a bounded window to
        // exit on its own before escalating.
        let name = self.container_name();
        for _ in 0..STOP_POLL_ATTEMPTS {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
            match self.docker.inspect(&name).await {
                Ok(snap) if snap.running => {}
                _ => return,
            }
        }
        self.kill().await;
    }

    async fn write_config_files(&self, files: &[(String, String)]) -> anyhow::Result<()> {
        for (file, contents) in files {
            let path = sandbox::resolve_in(&self.dir, file)
                .map_err(|e| anyhow::anyhow!("config template {file:?}: {e}"))?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create config directory for {file}"))?;
            }
            tokio::fs::write(&path, contents)
                .await
                .with_context(|| format!("write config template {file}"))?;
        }
        Ok(())
    }

    /// (Re)attach the container's stdio. The write half becomes the stdin
    /// sink; the read half is drained so the runtime never blocks on us.
    async fn attach_stdio(&self) -> anyhow::Result<()> {
        let name = self.container_name();
        let results = self.docker.attach(&name).await?;

        let mut output = results.output;
        tokio::spawn(async move {
            use futures_util::StreamExt;
            while let Some(item) = output.next().await {
                if item.is_err() {
                    break;
                }
            }
        });

        let mut state = self.state.lock().await;
        state.stdin = Some(results.input);
        Ok(())
    }

    async fn try_write(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let Some(stdin) = state.stdin.as_mut() else {
            anyhow::bail!("no stdin attached for server {}", self.id);
        };
        let result = async {
            stdin.write_all(bytes).await?;
            stdin.flush().await
        }
        .await;
        if let Err(err) = result {
            state.stdin = None;
            return Err(err).context("write to container stdin");
        }
        Ok(())
    }

    fn spawn_wait_watcher(self: &Arc<Self>, generation: u64) {
        let instance = self.clone();
        tokio::spawn(async move {
            let name = instance.container_name();
            let _exit = instance.docker.wait(&name).await;

            let mut state = instance.state.lock().await;
            if state.generation != generation {
                return;
            }
            state.running = false;
            state.started_at = None;
            state.stdin = None;
            drop(state);
            instance.events.emit(EventCategory::Status, MSG_STOPPED);
        });
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The runtime reports `StartedAt` as RFC 3339 with nanoseconds.
pub(crate) fn parse_runtime_time(raw: Option<&str>) -> Option<i64> {
    let raw = raw?;
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_carry_the_prefix() {
        let docker = match ContainerDriver::connect() {
            Ok(d) => d,
            // No runtime in the test environment; the name format is what
            // matters here.
            Err(_) => return,
        };
        let instance = ServerInstance::new("abc123", PathBuf::from("/tmp/abc123"), docker);
        assert_eq!(instance.container_name(), "hightd-abc123");
    }

    #[test]
    fn runtime_timestamps_parse_with_nanoseconds() {
        let ms = parse_runtime_time(Some("2024-03-01T10:20:30.123456789Z")).unwrap();
        assert_eq!(ms, 1_709_288_430_123);
        assert_eq!(parse_runtime_time(Some("not a time")), None);
        assert_eq!(parse_runtime_time(None), None);
    }

    #[test]
    fn status_strings_match_the_wire_values() {
        assert_eq!(InstanceStatus::Running.as_str(), "running");
        assert_eq!(InstanceStatus::Stopped.as_str(), "stopped");
    }
}
