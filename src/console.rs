use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use time::Date;
use tokio::task::JoinHandle;

use crate::config::DesktopConfig;
use crate::error::{ProcessError, ProcessResult};
use crate::event_bridge::{EventBridge, Subscription};
use crate::host::ProcessHost;
use crate::log_buffer::{export_file_name, LogAggregator, LogKind, LogSnapshot};
use crate::presentation::{ControlAffordances, Indicator, PanelVisibility};
use crate::status::{RunState, StatusEvent, StatusReconciler};
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendCommand {
    Start,
    Stop,
    Restart,
}

impl BackendCommand {
    fn verb(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }

    fn pending_message(self) -> &'static str {
        match self {
            Self::Start => "Starting backend...",
            Self::Stop => "Stopping backend...",
            Self::Restart => "Restarting backend...",
        }
    }

    fn done_message(self) -> &'static str {
        match self {
            Self::Start => "Backend started",
            Self::Stop => "Backend stopped",
            Self::Restart => "Backend restarted",
        }
    }

    fn status_event(self) -> StatusEvent {
        match self {
            Self::Start => StatusEvent::StartSucceeded,
            Self::Stop => StatusEvent::StopSucceeded,
            Self::Restart => StatusEvent::RestartSucceeded,
        }
    }
}

/// The four listeners a console holds while attached. Dropping releases all of them.
#[derive(Debug)]
pub struct ConsoleSubscriptions {
    subscriptions: Vec<Subscription>,
}

impl ConsoleSubscriptions {
    pub fn active_count(&self) -> usize {
        self.subscriptions
            .iter()
            .filter(|subscription| subscription.is_active())
            .count()
    }

    pub fn release(&self) {
        for subscription in &self.subscriptions {
            subscription.release();
        }
    }
}

impl Drop for ConsoleSubscriptions {
    fn drop(&mut self) {
        self.release();
    }
}

/// One log viewer session: narrates backend commands into the log buffer and keeps
/// the run state in step with host events.
pub struct LogConsole<H> {
    supervisor: Arc<ProcessSupervisor<H>>,
    bridge: EventBridge,
    logs: Arc<LogAggregator>,
    status: Arc<StatusReconciler>,
    panel: Arc<Mutex<PanelVisibility>>,
    product_name: String,
}

impl<H: ProcessHost + 'static> LogConsole<H> {
    pub fn new(
        config: &DesktopConfig,
        supervisor: Arc<ProcessSupervisor<H>>,
        bridge: EventBridge,
    ) -> Self {
        Self {
            supervisor,
            bridge,
            logs: Arc::new(LogAggregator::new(config.log_capacity)),
            status: Arc::new(StatusReconciler::new()),
            panel: Arc::new(Mutex::new(PanelVisibility::default())),
            product_name: config.product_name.clone(),
        }
    }

    pub fn attach(&self) -> ConsoleSubscriptions {
        let logs = self.logs.clone();
        let on_log = self.bridge.on_log(move |line| {
            logs.append(LogKind::Log, line);
        });

        let logs = self.logs.clone();
        let on_error = self.bridge.on_error(move |line| {
            logs.append(LogKind::Error, line);
        });

        let logs = self.logs.clone();
        let status = self.status.clone();
        let on_terminated = self.bridge.on_terminated(move |info| {
            logs.append(LogKind::System, &format!("Backend terminated: {info}"));
            status.apply(StatusEvent::Terminated);
        });

        let panel = self.panel.clone();
        let on_show = self.bridge.on_show_requested(move || {
            panel.lock().unwrap_or_else(PoisonError::into_inner).show();
        });

        ConsoleSubscriptions {
            subscriptions: vec![on_log, on_error, on_terminated, on_show],
        }
    }

    pub async fn start(&self) -> ProcessResult<()> {
        self.run(BackendCommand::Start).await
    }

    pub async fn stop(&self) -> ProcessResult<()> {
        self.run(BackendCommand::Stop).await
    }

    pub async fn restart(&self) -> ProcessResult<()> {
        self.run(BackendCommand::Restart).await
    }

    async fn run(&self, command: BackendCommand) -> ProcessResult<()> {
        if !self.supervisor.context().is_desktop_context() {
            return Err(ProcessError::NotDesktopContext);
        }

        self.logs.append(LogKind::System, command.pending_message());
        let result = match command {
            BackendCommand::Start => self.supervisor.start().await,
            BackendCommand::Stop => self.supervisor.stop().await,
            BackendCommand::Restart => self.supervisor.restart().await,
        };

        match &result {
            Ok(()) => {
                self.status.apply(command.status_event());
                self.logs.append(LogKind::System, command.done_message());
            }
            Err(error) => {
                log::warn!("[console] {} failed: {error}", command.verb());
                self.logs.append(
                    LogKind::Error,
                    &format!("Failed to {}: {error}", command.verb()),
                );
            }
        }
        result
    }

    pub async fn poll_status(&self) -> RunState {
        self.status.poll_once(&self.supervisor).await
    }

    pub fn spawn_status_polling(&self, interval: Duration) -> JoinHandle<()> {
        self.status
            .spawn_poll_loop(self.supervisor.clone(), interval)
    }

    pub fn entries(&self) -> LogSnapshot {
        self.logs.entries()
    }

    pub fn logs(&self) -> &Arc<LogAggregator> {
        &self.logs
    }

    pub fn clear(&self) {
        self.logs.clear();
    }

    pub fn export_text(&self) -> String {
        self.logs.export_text()
    }

    pub fn export_file_name(&self, date: Date) -> String {
        export_file_name(&self.product_name, date)
    }

    /// Writes the export into `directory` under the dated file name.
    pub fn export_to(&self, directory: &Path, date: Date) -> Result<PathBuf, String> {
        let path = directory.join(self.export_file_name(date));
        let written = self.logs.write_export(&path)?;
        log::info!("[console] exported {written} bytes to {}", path.display());
        Ok(path)
    }

    pub fn status(&self) -> &Arc<StatusReconciler> {
        &self.status
    }

    pub fn run_state(&self) -> RunState {
        self.status.current()
    }

    pub fn indicator(&self) -> Indicator {
        Indicator::for_state(self.run_state())
    }

    pub fn affordances(&self) -> ControlAffordances {
        ControlAffordances::for_state(self.run_state())
    }

    pub fn panel(&self) -> PanelVisibility {
        *self.panel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn show_panel(&self) {
        self.panel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .show();
    }

    pub fn minimize_panel(&self) {
        self.panel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .minimize();
    }
}
