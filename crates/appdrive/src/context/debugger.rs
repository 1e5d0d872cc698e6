use super::WebContext;
use crate::Result;
use async_trait::async_trait;
use tracing::debug;

/// Bridge to the remote web inspector of the device.
///
/// The engine holds the remote-command gate open around every call, so
/// queued commands other than alert handling wait for it.
#[async_trait]
pub trait RemoteDebugger: Send + Sync {
    async fn select_page(&self, page: &WebContext) -> Result<()>;

    /// Stops waiting for a page load started by an earlier selection.
    async fn cancel_page_load(&self);

    async fn disconnect(&self) {}
}

/// Used when no inspector bridge is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRemoteDebugger;

#[async_trait]
impl RemoteDebugger for NoopRemoteDebugger {
    async fn select_page(&self, page: &WebContext) -> Result<()> {
        debug!(id = %page.id, "No remote debugger attached, page selection is local only");
        Ok(())
    }

    async fn cancel_page_load(&self) {}
}
