use tracing::warn;

/// Chat/alerting is an external collaborator; the pipeline only ever talks
/// to this seam. The default sink writes warnings to the log.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &str, detail: &str);
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &str, detail: &str) {
        warn!(event, detail, "notification");
    }
}
