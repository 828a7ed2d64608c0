use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::DesktopConfig;
use crate::host::{EventEmitter, HostEvent, ProcessHost};

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub restart_settle_delay: Duration,
}

impl From<&DesktopConfig> for BackendLaunch {
    fn from(config: &DesktopConfig) -> Self {
        Self {
            program: config.backend_program.clone(),
            args: config.backend_args.clone(),
            env: config.backend_env.clone(),
            restart_settle_delay: config.restart_settle_delay(),
        }
    }
}

type KillAck = oneshot::Sender<String>;

struct RunningBackend {
    run_id: Uuid,
    pid: Option<u32>,
    kill: oneshot::Sender<KillAck>,
}

enum ChildOutcome {
    Exited(io::Result<ExitStatus>),
    KillRequested(Option<KillAck>),
}

/// Owns at most one backend child process and relays its output as host events.
pub struct BackendHost<E> {
    launch: BackendLaunch,
    emitter: Arc<E>,
    slot: Arc<Mutex<Option<RunningBackend>>>,
}

impl<E: EventEmitter> BackendHost<E> {
    pub fn new(launch: BackendLaunch, emitter: E) -> Self {
        Self {
            launch,
            emitter: Arc::new(emitter),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn emitter(&self) -> &E {
        &self.emitter
    }

    pub async fn backend_pid(&self) -> Option<u32> {
        self.slot.lock().await.as_ref().and_then(|running| running.pid)
    }

    /// Emits a show-logs request, as the tray "View Logs" item does.
    pub fn request_show_logs(&self) {
        if let Err(error) = self.emitter.emit(HostEvent::ShowRequested) {
            log::warn!("[sidecar] failed to emit show-logs: {error}");
        }
    }

    fn spawn_backend(&self) -> Result<RunningBackend, String> {
        let mut command = Command::new(&self.launch.program);
        command
            .args(&self.launch.args)
            .envs(&self.launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|error| {
            format!(
                "Failed to spawn backend \"{}\": {error}",
                self.launch.program
            )
        })?;

        let run_id = Uuid::new_v4();
        let pid = child.id();
        log::info!(
            "[sidecar] spawned backend program={} pid={} run_id={run_id}",
            self.launch.program,
            pid.map(|pid| pid.to_string()).unwrap_or_else(|| "?".to_string())
        );

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_relay(stdout, self.emitter.clone(), HostEvent::Log));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_relay(stderr, self.emitter.clone(), HostEvent::Error));
        }

        let (kill, kill_requests) = oneshot::channel();
        tokio::spawn(supervise_child(
            child,
            run_id,
            kill_requests,
            readers,
            self.emitter.clone(),
            self.slot.clone(),
        ));

        Ok(RunningBackend { run_id, pid, kill })
    }
}

#[async_trait]
impl<E: EventEmitter> ProcessHost for BackendHost<E> {
    async fn start_backend(&self) -> Result<String, String> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return Err("Backend is already running".to_string());
        }

        *slot = Some(self.spawn_backend()?);
        Ok("Backend started successfully".to_string())
    }

    async fn stop_backend(&self) -> Result<String, String> {
        let running = self
            .slot
            .lock()
            .await
            .take()
            .ok_or_else(|| "Backend is not running".to_string())?;

        let reason = terminate(running).await;
        log::info!("[sidecar] backend stopped: {reason}");
        Ok("Backend stopped successfully".to_string())
    }

    async fn restart_backend(&self) -> Result<String, String> {
        // The slot stays locked for the whole cycle so no start can slip in between.
        let mut slot = self.slot.lock().await;
        if let Some(running) = slot.take() {
            let reason = terminate(running).await;
            log::info!("[sidecar] backend stopped for restart: {reason}");
        }

        tokio::time::sleep(self.launch.restart_settle_delay).await;

        *slot = Some(self.spawn_backend()?);
        Ok("Backend restarted successfully".to_string())
    }

    async fn get_backend_status(&self) -> Result<bool, String> {
        Ok(self.slot.lock().await.is_some())
    }
}

async fn terminate(running: RunningBackend) -> String {
    let (ack, ack_received) = oneshot::channel();
    if running.kill.send(ack).is_err() {
        return "already exited".to_string();
    }
    ack_received
        .await
        .unwrap_or_else(|_| "already exited".to_string())
}

fn spawn_line_relay<R, E>(
    stream: R,
    emitter: Arc<E>,
    into_event: fn(String) -> HostEvent,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    E: EventEmitter,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer);
                    let line = line.trim_end_matches(|ch: char| ch == '\n' || ch == '\r');
                    if let Err(error) = emitter.emit(into_event(line.to_string())) {
                        log::debug!("[sidecar] dropped backend output line: {error}");
                    }
                }
                Err(error) => {
                    log::warn!("[sidecar] backend output stream failed: {error}");
                    break;
                }
            }
        }
    })
}

async fn supervise_child<E: EventEmitter>(
    mut child: Child,
    run_id: Uuid,
    mut kill_requests: oneshot::Receiver<KillAck>,
    readers: Vec<JoinHandle<()>>,
    emitter: Arc<E>,
    slot: Arc<Mutex<Option<RunningBackend>>>,
) {
    let outcome = tokio::select! {
        status = child.wait() => ChildOutcome::Exited(status),
        request = &mut kill_requests => ChildOutcome::KillRequested(request.ok()),
    };

    let (status, ack) = match outcome {
        ChildOutcome::Exited(status) => {
            let ack = release_slot(&slot, run_id, &mut kill_requests).await;
            (status, ack)
        }
        ChildOutcome::KillRequested(ack) => {
            if let Err(error) = child.start_kill() {
                log::warn!("[sidecar] failed to kill backend run_id={run_id}: {error}");
            }
            (child.wait().await, ack)
        }
    };

    // Let the relays flush what the child wrote before it went away.
    for reader in readers {
        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
    }

    let reason = match status {
        Ok(status) => status.to_string(),
        Err(error) => format!("wait failed: {error}"),
    };
    log::info!("[sidecar] backend run_id={run_id} terminated: {reason}");
    if let Err(error) = emitter.emit(HostEvent::Terminated(reason.clone())) {
        log::warn!("[sidecar] failed to emit termination: {error}");
    }
    if let Some(ack) = ack {
        let _ = ack.send(reason);
    }
}

/// Frees the slot after a natural exit so the host reads as stopped before termination is
/// announced. A stop or restart that already took the slot may be holding its lock while it
/// waits for the ack, so a pending kill request wins over the lock.
async fn release_slot(
    slot: &Mutex<Option<RunningBackend>>,
    run_id: Uuid,
    kill_requests: &mut oneshot::Receiver<KillAck>,
) -> Option<KillAck> {
    let acquired = tokio::select! {
        guard = slot.lock() => Ok(guard),
        request = &mut *kill_requests => Err(request.ok()),
    };

    match acquired {
        Ok(mut slot) => {
            if slot.as_ref().map(|running| running.run_id) == Some(run_id) {
                *slot = None;
            }
            drop(slot);
            kill_requests.try_recv().ok()
        }
        Err(ack) => ack,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::host::BroadcastEmitter;
    use tokio::sync::broadcast;

    fn shell_host(script: &str) -> (BackendHost<BroadcastEmitter>, broadcast::Receiver<HostEvent>) {
        let emitter = BroadcastEmitter::new();
        let receiver = emitter.subscribe();
        let launch = BackendLaunch {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            restart_settle_delay: Duration::from_millis(10),
        };
        (BackendHost::new(launch, emitter), receiver)
    }

    async fn next_event(receiver: &mut broadcast::Receiver<HostEvent>) -> HostEvent {
        tokio::time::timeout(Duration::from_secs(10), receiver.recv())
            .await
            .expect("timed out waiting for host event")
            .expect("host event channel closed")
    }

    async fn events_until_terminated(
        receiver: &mut broadcast::Receiver<HostEvent>,
    ) -> Vec<HostEvent> {
        let mut events = Vec::new();
        loop {
            let event = next_event(receiver).await;
            let done = matches!(event, HostEvent::Terminated(_));
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn relays_output_then_termination() {
        let (host, mut receiver) = shell_host("echo hello; echo oops 1>&2; exit 3");
        assert_eq!(host.start_backend().await.unwrap(), "Backend started successfully");

        let events = events_until_terminated(&mut receiver).await;
        assert!(events.contains(&HostEvent::Log("hello".to_string())));
        assert!(events.contains(&HostEvent::Error("oops".to_string())));
        assert_eq!(
            events.last(),
            Some(&HostEvent::Terminated("exit status: 3".to_string()))
        );

        for _ in 0..100 {
            if !host.get_backend_status().await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("backend still reported as running after it exited");
    }

    #[tokio::test]
    async fn start_and_stop_report_host_errors() {
        let (host, mut receiver) = shell_host("echo up; exec sleep 30");
        host.start_backend().await.unwrap();
        assert_eq!(
            host.start_backend().await.unwrap_err(),
            "Backend is already running"
        );
        assert!(host.get_backend_status().await.unwrap());
        assert!(host.backend_pid().await.is_some());
        assert_eq!(next_event(&mut receiver).await, HostEvent::Log("up".to_string()));

        assert_eq!(host.stop_backend().await.unwrap(), "Backend stopped successfully");
        assert!(!host.get_backend_status().await.unwrap());
        assert!(matches!(
            next_event(&mut receiver).await,
            HostEvent::Terminated(_)
        ));
        assert_eq!(host.stop_backend().await.unwrap_err(), "Backend is not running");
    }

    #[tokio::test]
    async fn restart_replaces_the_running_child() {
        let (host, mut receiver) = shell_host("echo up; exec sleep 30");
        host.start_backend().await.unwrap();
        let first_pid = host.backend_pid().await;
        assert_eq!(next_event(&mut receiver).await, HostEvent::Log("up".to_string()));

        assert_eq!(
            host.restart_backend().await.unwrap(),
            "Backend restarted successfully"
        );
        assert!(host.get_backend_status().await.unwrap());
        assert_ne!(host.backend_pid().await, first_pid);

        assert!(matches!(
            next_event(&mut receiver).await,
            HostEvent::Terminated(_)
        ));
        assert_eq!(next_event(&mut receiver).await, HostEvent::Log("up".to_string()));
        host.stop_backend().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exited_backend_reads_as_stopped_once_termination_arrives() {
        let (host, mut receiver) = shell_host("exit 0");
        for _ in 0..20 {
            host.start_backend().await.unwrap();
            events_until_terminated(&mut receiver).await;

            assert!(!host.get_backend_status().await.unwrap());
        }
        host.start_backend().await.unwrap();
    }

    #[tokio::test]
    async fn missing_executable_is_a_host_error() {
        let emitter = BroadcastEmitter::new();
        let launch = BackendLaunch {
            program: "/nonexistent/octopus-server".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            restart_settle_delay: Duration::ZERO,
        };
        let host = BackendHost::new(launch, emitter);

        let error = host.start_backend().await.unwrap_err();
        assert!(error.starts_with("Failed to spawn backend"));
        assert!(!host.get_backend_status().await.unwrap());
    }

    #[tokio::test]
    async fn show_logs_request_is_emitted() {
        let (host, mut receiver) = shell_host("true");
        host.request_show_logs();
        assert_eq!(next_event(&mut receiver).await, HostEvent::ShowRequested);
    }
}
