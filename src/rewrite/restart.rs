use std::time::Duration;

/// Hands control back to the process supervisor.
pub trait Restarter: Send + Sync {
    /// Arrange for the process to stop after `delay`. Must not block.
    fn schedule_restart(&self, delay: Duration);
}

/// Exits the process with status 0 after the delay, leaving the restart to
/// systemd, a container runtime or similar.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRestarter;

impl Restarter for ProcessRestarter {
    fn schedule_restart(&self, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::warn!("Exiting for supervisor restart");
            std::process::exit(0);
        });
    }
}
