use crate::desktop::DesktopContext;
use crate::error::{ProcessError, ProcessResult};
use crate::host::ProcessHost;

/// Gated front for the host's backend commands. It never records log entries itself.
pub struct ProcessSupervisor<H> {
    context: DesktopContext,
    host: H,
}

impl<H: ProcessHost> ProcessSupervisor<H> {
    pub fn new(context: DesktopContext, host: H) -> Self {
        Self { context, host }
    }

    pub fn context(&self) -> &DesktopContext {
        &self.context
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub async fn start(&self) -> ProcessResult<()> {
        self.ensure_desktop()?;
        let reply = self.host.start_backend().await.map_err(ProcessError::host)?;
        log::info!("[supervisor] start: {reply}");
        Ok(())
    }

    pub async fn stop(&self) -> ProcessResult<()> {
        self.ensure_desktop()?;
        let reply = self.host.stop_backend().await.map_err(ProcessError::host)?;
        log::info!("[supervisor] stop: {reply}");
        Ok(())
    }

    /// Stop-then-start is performed by the host as one operation.
    pub async fn restart(&self) -> ProcessResult<()> {
        self.ensure_desktop()?;
        let reply = self
            .host
            .restart_backend()
            .await
            .map_err(ProcessError::host)?;
        log::info!("[supervisor] restart: {reply}");
        Ok(())
    }

    /// `Ok(false)` means the host reports the backend as not running; only a failed
    /// host call is an error.
    pub async fn query_status(&self) -> ProcessResult<bool> {
        self.ensure_desktop()?;
        self.host
            .get_backend_status()
            .await
            .map_err(ProcessError::host)
    }

    fn ensure_desktop(&self) -> ProcessResult<()> {
        if self.context.is_desktop_context() {
            Ok(())
        } else {
            Err(ProcessError::NotDesktopContext)
        }
    }
}
