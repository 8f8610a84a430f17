//! The cancellation-and-reason value handed to an executing stage.

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopSignalKind {
    /// Cancelled by a user command; rollback follows the application's
    /// auto-rollback setting.
    Cancel,
    CancelWithRollback,
    CancelWithoutRollback,
    /// The stage or deployment deadline passed.
    Timeout,
    /// The agent is shutting down. Never rolls back.
    Shutdown,
}

impl StopSignalKind {
    pub fn wants_rollback(&self, auto_rollback: bool) -> bool {
        match self {
            StopSignalKind::Cancel => auto_rollback,
            StopSignalKind::CancelWithRollback => true,
            StopSignalKind::CancelWithoutRollback => false,
            StopSignalKind::Timeout => auto_rollback,
            StopSignalKind::Shutdown => false,
        }
    }

    pub fn is_cancel(&self) -> bool {
        matches!(
            self,
            StopSignalKind::Cancel
                | StopSignalKind::CancelWithRollback
                | StopSignalKind::CancelWithoutRollback
        )
    }
}

pub fn stop_signal() -> (StopSender, StopSignal) {
    let (tx, rx) = watch::channel(None);
    (StopSender { tx }, StopSignal { rx })
}

pub struct StopSender {
    tx: watch::Sender<Option<StopSignalKind>>,
}

impl StopSender {
    /// Raise the signal. The first signal wins; later ones are ignored so
    /// the reason seen by the executor is stable.
    pub fn signal(&self, kind: StopSignalKind) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(kind);
                true
            } else {
                false
            }
        });
    }

    pub fn subscribe(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Executor-side view of the stop signal. Executors check it between
/// logical steps and return promptly once it fires.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<Option<StopSignalKind>>,
}

impl StopSignal {
    pub fn signaled(&self) -> Option<StopSignalKind> {
        *self.rx.borrow()
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled().is_some()
    }

    /// Wait until the signal fires.
    pub async fn wait(&mut self) -> StopSignalKind {
        loop {
            if let Some(kind) = *self.rx.borrow_and_update() {
                return kind;
            }
            if self.rx.changed().await.is_err() {
                // sender dropped without signaling; treat as shutdown
                return StopSignalKind::Shutdown;
            }
        }
    }

    /// Sleep that returns early when the signal fires.
    pub async fn sleep(&mut self, duration: std::time::Duration) -> Option<StopSignalKind> {
        tokio::select! {
            kind = self.wait() => Some(kind),
            _ = tokio::time::sleep(duration) => self.signaled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_signal_wins() {
        let (sender, signal) = stop_signal();
        sender.signal(StopSignalKind::CancelWithRollback);
        sender.signal(StopSignalKind::Shutdown);
        assert_eq!(signal.signaled(), Some(StopSignalKind::CancelWithRollback));
    }

    #[tokio::test]
    async fn test_wait_returns_on_signal() {
        let (sender, mut signal) = stop_signal();
        let task = tokio::spawn(async move { signal.wait().await });
        sender.signal(StopSignalKind::Timeout);
        assert_eq!(task.await.unwrap(), StopSignalKind::Timeout);
    }

    #[test]
    fn test_rollback_decision() {
        assert!(StopSignalKind::CancelWithRollback.wants_rollback(false));
        assert!(!StopSignalKind::CancelWithoutRollback.wants_rollback(true));
        assert!(StopSignalKind::Cancel.wants_rollback(true));
        assert!(!StopSignalKind::Cancel.wants_rollback(false));
        assert!(!StopSignalKind::Shutdown.wants_rollback(true));
    }
}
