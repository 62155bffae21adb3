//! Finding fan-out to interested collaborators.
//!
//! Fire-and-forget: a lagging or absent subscriber never fails a cycle.

use crate::detect::Finding;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone)]
pub struct FindingNotifier {
    tx: broadcast::Sender<Finding>,
}

impl FindingNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast one finding. Send errors (no live subscribers) are ignored.
    pub fn notify(&self, finding: &Finding) {
        match self.tx.send(finding.clone()) {
            Ok(receivers) => {
                debug!(finding = %finding.id, receivers, "Finding broadcast")
            }
            Err(_) => debug!(finding = %finding.id, "No subscribers for finding"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Finding> {
        self.tx.subscribe()
    }
}
