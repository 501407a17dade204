//! Cooperative cancellation plumbing. Every timed wait in the deployment
//! core goes through [sleep] so a cancel request is observed promptly
//! instead of after whatever drain or backoff happened to be in flight.

use error::*;
use result::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::Cancelled)]
#[error("the deployment attempt was cancelled")]
pub struct Cancelled {}

pub fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Cancelled {}.into())
    } else {
        Ok(())
    }
}

pub async fn sleep(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled {}.into()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_reflects_the_token() {
        let token = CancellationToken::new();
        assert!(checkpoint(&token).is_ok());
        token.cancel();
        let err = checkpoint(&token).unwrap_err();
        assert_eq!(err.fault(), FaultKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_returns_early_on_cancel() {
        let token = CancellationToken::new();
        let waiter = sleep(&token, Duration::from_secs(600));
        token.cancel();
        let err = waiter.await.unwrap_err();
        assert_eq!(err.fault(), FaultKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_when_left_alone() {
        let token = CancellationToken::new();
        assert!(sleep(&token, Duration::from_millis(10)).await.is_ok());
    }
}
