use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Run-scoped cancellation signal. Clones observe the same flag.
#[derive(Clone, Debug)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                // the sender lives as long as `self`, so this cannot fire
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelReason {
    Requested,
    BudgetExceeded(Duration),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("cancellation requested"),
            Self::BudgetExceeded(budget) => {
                write!(f, "run budget of {}s exceeded", budget.as_secs())
            }
        }
    }
}

/// Resolves when the run must stop: the token fires or the optional
/// wall-clock budget elapses.
pub(crate) async fn interruption(token: &CancelToken, budget: Option<Duration>) -> CancelReason {
    let budget_elapsed = async {
        match budget {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                limit
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => CancelReason::Requested,
        limit = budget_elapsed => CancelReason::BudgetExceeded(limit),
    }
}
