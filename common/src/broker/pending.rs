use tokio::sync::watch;

use crate::{config::ConnectionInfo, rpc::Status};

pub(crate) type Outcome = Option<Result<ConnectionInfo, Status>>;

/// Single-assignment slot for the announcement of one service id.
pub(crate) struct PendingDial {
    slot: watch::Sender<Outcome>,
}

impl PendingDial {
    pub(crate) fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    pub(crate) fn resolved(outcome: Result<ConnectionInfo, Status>) -> Self {
        let (slot, _) = watch::channel(Some(outcome));
        Self { slot }
    }

    /// Store `outcome` unless the slot already holds one. Returns whether it
    /// was stored.
    pub(crate) fn resolve(&self, outcome: Result<ConnectionInfo, Status>) -> bool {
        self.slot.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Outcome> {
        self.slot.subscribe()
    }
}
