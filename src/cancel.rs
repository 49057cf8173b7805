//! Racing chunk operations against caller cancellation.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ExportError;

/// Races operations against a long-lived cancellation token.
///
/// When cancellation wins the operation future is dropped without being
/// polled again, which releases everything it owns.
#[derive(Debug, Clone)]
pub struct CancellationGate {
    token: CancellationToken,
}

impl CancellationGate {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails with [`ExportError::Cancelled`] if already cancelled.
    pub fn check(&self) -> Result<(), ExportError> {
        if self.token.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        Ok(())
    }

    pub async fn race<F>(&self, operation: F) -> Result<F::Output, ExportError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                info!("Export cancelled");
                Err(ExportError::Cancelled)
            }
            output = operation => Ok(output),
        }
    }
}
