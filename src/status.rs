use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::host::ProcessHost;
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Unknown,
    Stopped,
    Running,
}

impl RunState {
    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    StartSucceeded,
    RestartSucceeded,
    StopSucceeded,
    /// Pushed by the host; may arrive without any stop having been requested.
    Terminated,
    PollSucceeded(bool),
    PollFailed,
}

/// Last writer wins, except that a failed poll never overwrites what is known.
pub fn reduce(current: RunState, event: StatusEvent) -> RunState {
    match event {
        StatusEvent::StartSucceeded | StatusEvent::RestartSucceeded => RunState::Running,
        StatusEvent::StopSucceeded | StatusEvent::Terminated => RunState::Stopped,
        StatusEvent::PollSucceeded(true) => RunState::Running,
        StatusEvent::PollSucceeded(false) => RunState::Stopped,
        StatusEvent::PollFailed => current,
    }
}

/// Sole owner of the RunState. Consumers watch it; only `apply` writes it.
#[derive(Debug)]
pub struct StatusReconciler {
    state: watch::Sender<RunState>,
}

impl StatusReconciler {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RunState::Unknown);
        Self { state }
    }

    pub fn current(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn apply(&self, event: StatusEvent) -> RunState {
        let mut next = RunState::Unknown;
        self.state.send_if_modified(|state| {
            next = reduce(*state, event);
            let changed = next != *state;
            *state = next;
            changed
        });
        next
    }

    /// One poll tick. Outside the desktop context nothing is asked and nothing changes.
    pub async fn poll_once<H: ProcessHost>(&self, supervisor: &ProcessSupervisor<H>) -> RunState {
        if !supervisor.context().is_desktop_context() {
            return self.current();
        }

        match supervisor.query_status().await {
            Ok(running) => self.apply(StatusEvent::PollSucceeded(running)),
            Err(error) => {
                log::warn!("[status] poll failed, keeping {:?}: {error}", self.current());
                self.apply(StatusEvent::PollFailed)
            }
        }
    }

    /// Polls immediately, then every `interval`, until the handle is aborted or the
    /// reconciler is dropped.
    pub fn spawn_poll_loop<H>(
        self: &Arc<Self>,
        supervisor: Arc<ProcessSupervisor<H>>,
        interval: Duration,
    ) -> JoinHandle<()>
    where
        H: ProcessHost + 'static,
    {
        let reconciler = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(reconciler) = reconciler.upgrade() else {
                    break;
                };
                reconciler.poll_once(&supervisor).await;
            }
        })
    }
}

impl Default for StatusReconciler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desktop::DesktopContext;
    use crate::supervisor::test_support::FakeHost;
    use std::sync::atomic::Ordering;

    #[test]
    fn reducer_follows_commands_and_termination() {
        let state = reduce(RunState::Unknown, StatusEvent::StartSucceeded);
        assert_eq!(state, RunState::Running);
        assert_eq!(reduce(state, StatusEvent::Terminated), RunState::Stopped);
        assert_eq!(
            reduce(RunState::Stopped, StatusEvent::RestartSucceeded),
            RunState::Running
        );
        assert_eq!(
            reduce(RunState::Running, StatusEvent::StopSucceeded),
            RunState::Stopped
        );
    }

    #[test]
    fn successful_poll_is_authoritative() {
        assert_eq!(
            reduce(RunState::Running, StatusEvent::PollSucceeded(false)),
            RunState::Stopped
        );
        assert_eq!(
            reduce(RunState::Unknown, StatusEvent::PollSucceeded(true)),
            RunState::Running
        );
    }

    #[test]
    fn failed_poll_keeps_every_state() {
        for state in [RunState::Unknown, RunState::Stopped, RunState::Running] {
            assert_eq!(reduce(state, StatusEvent::PollFailed), state);
        }
    }

    #[test]
    fn watchers_see_only_real_changes() {
        let reconciler = StatusReconciler::new();
        let mut watcher = reconciler.watch();
        assert!(!watcher.has_changed().unwrap());

        reconciler.apply(StatusEvent::StartSucceeded);
        assert!(watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), RunState::Running);

        reconciler.apply(StatusEvent::PollSucceeded(true));
        assert!(!watcher.has_changed().unwrap());
    }

    #[tokio::test]
    async fn failed_poll_tick_does_not_clobber_running() {
        let host = FakeHost::running();
        let supervisor = ProcessSupervisor::new(DesktopContext::desktop(), host);
        let reconciler = StatusReconciler::new();

        reconciler.apply(StatusEvent::StartSucceeded);
        supervisor.host().fail_next_status("host unreachable");

        assert_eq!(reconciler.poll_once(&supervisor).await, RunState::Running);
        assert_eq!(reconciler.current(), RunState::Running);
    }

    #[tokio::test]
    async fn poll_outside_desktop_leaves_state_unknown() {
        let supervisor = ProcessSupervisor::new(DesktopContext::browser(), FakeHost::running());
        let reconciler = StatusReconciler::new();

        assert_eq!(reconciler.poll_once(&supervisor).await, RunState::Unknown);
        assert_eq!(supervisor.host().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_corrects_stale_optimistic_state() {
        let supervisor = Arc::new(ProcessSupervisor::new(
            DesktopContext::desktop(),
            FakeHost::running(),
        ));
        let reconciler = Arc::new(StatusReconciler::new());
        let mut watcher = reconciler.watch();

        let poller = reconciler.spawn_poll_loop(supervisor.clone(), Duration::from_secs(5));
        watcher.changed().await.unwrap();
        assert_eq!(reconciler.current(), RunState::Running);

        supervisor.host().set_running(false);
        watcher.changed().await.unwrap();
        assert_eq!(reconciler.current(), RunState::Stopped);

        poller.abort();
    }
}
