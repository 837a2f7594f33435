// Progress delivery abstraction

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::models::DownloadEvent;

/// Receives download events from the worker.
///
/// Called on the worker's task, so implementations must return promptly;
/// marshalling onto a UI thread is the receiver's concern.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: DownloadEvent);
}

impl ProgressSink for UnboundedSender<DownloadEvent> {
    fn emit(&self, event: DownloadEvent) {
        if self.send(event).is_err() {
            debug!("Progress receiver dropped, event discarded");
        }
    }
}

/// Adapts a plain closure into a [`ProgressSink`].
pub struct CallbackSink<F>(pub F);

impl<F> ProgressSink for CallbackSink<F>
where
    F: Fn(DownloadEvent) + Send + Sync,
{
    fn emit(&self, event: DownloadEvent) {
        (self.0)(event)
    }
}

/// Discards everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: DownloadEvent) {}
}
