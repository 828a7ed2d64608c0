use async_trait::async_trait;
use tokio::sync::broadcast;

pub const START_BACKEND_COMMAND: &str = "start_backend";
pub const STOP_BACKEND_COMMAND: &str = "stop_backend";
pub const RESTART_BACKEND_COMMAND: &str = "restart_backend";
pub const GET_BACKEND_STATUS_COMMAND: &str = "get_backend_status";

pub const BACKEND_LOG_EVENT: &str = "backend-log";
pub const BACKEND_ERROR_EVENT: &str = "backend-error";
pub const BACKEND_TERMINATED_EVENT: &str = "backend-terminated";
pub const SHOW_LOGS_EVENT: &str = "show-logs";

const HOST_EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Log,
    Error,
    Terminated,
    ShowRequested,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Log,
        EventKind::Error,
        EventKind::Terminated,
        EventKind::ShowRequested,
    ];

    pub fn event_name(self) -> &'static str {
        match self {
            Self::Log => BACKEND_LOG_EVENT,
            Self::Error => BACKEND_ERROR_EVENT,
            Self::Terminated => BACKEND_TERMINATED_EVENT,
            Self::ShowRequested => SHOW_LOGS_EVENT,
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.event_name() == name)
    }
}

/// One notification pushed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Log(String),
    Error(String),
    /// Human-readable termination reason.
    Terminated(String),
    ShowRequested,
}

impl HostEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Log(_) => EventKind::Log,
            Self::Error(_) => EventKind::Error,
            Self::Terminated(_) => EventKind::Terminated,
            Self::ShowRequested => EventKind::ShowRequested,
        }
    }

    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Log(text) | Self::Error(text) | Self::Terminated(text) => Some(text.as_str()),
            Self::ShowRequested => None,
        }
    }
}

/// Request/response surface of the process host. Errors are the host's own messages.
#[async_trait]
pub trait ProcessHost: Send + Sync {
    async fn start_backend(&self) -> Result<String, String>;
    async fn stop_backend(&self) -> Result<String, String>;
    async fn restart_backend(&self) -> Result<String, String>;
    async fn get_backend_status(&self) -> Result<bool, String>;
}

#[async_trait]
impl<H: ProcessHost + ?Sized> ProcessHost for std::sync::Arc<H> {
    async fn start_backend(&self) -> Result<String, String> {
        (**self).start_backend().await
    }

    async fn stop_backend(&self) -> Result<String, String> {
        (**self).stop_backend().await
    }

    async fn restart_backend(&self) -> Result<String, String> {
        (**self).restart_backend().await
    }

    async fn get_backend_status(&self) -> Result<bool, String> {
        (**self).get_backend_status().await
    }
}

/// Outgoing side of the host event channel.
pub trait EventEmitter: Send + Sync + 'static {
    fn emit(&self, event: HostEvent) -> Result<(), String>;
}

/// In-process host event channel.
#[derive(Debug, Clone)]
pub struct BroadcastEmitter {
    sender: broadcast::Sender<HostEvent>,
}

impl BroadcastEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HOST_EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn sender(&self) -> broadcast::Sender<HostEvent> {
        self.sender.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter for BroadcastEmitter {
    fn emit(&self, event: HostEvent) -> Result<(), String> {
        // No receivers is not an error: nobody is listening yet.
        let _ = self.sender.send(event);
        Ok(())
    }
}
