//! Write-once promise/future pairs settled by dispatched tasks.
//!
//! A dispatched fn task settles exactly one [`Promise`]; the caller awaits
//! the matching [`FnFuture`] under its own deadline. Dropping a promise
//! unsettled resolves the future with an internal error rather than hanging
//! the caller.

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::errors::CodeError;
use crate::response::FnResponse;

type Settled = Result<FnResponse, CodeError>;

/// The write side: settled once by the task that ran the fn.
pub struct Promise {
    tx: oneshot::Sender<Settled>,
}

/// The read side: awaited by the dispatching caller.
pub struct FnFuture {
    rx: oneshot::Receiver<Settled>,
}

/// Creates a linked promise/future pair.
pub fn pair() -> (Promise, FnFuture) {
    let (tx, rx) = oneshot::channel();
    (Promise { tx }, FnFuture { rx })
}

impl Promise {
    /// Settles with a successful response.
    pub fn succeed(self, response: FnResponse) {
        // The caller may have given up on its deadline already.
        let _ = self.tx.send(Ok(response));
    }

    /// Settles with a failure.
    pub fn fail(self, err: CodeError) {
        let _ = self.tx.send(Err(err));
    }
}

impl FnFuture {
    /// Awaits the settled result, bounded by an optional deadline.
    ///
    /// A deadline expiry yields a 408 class error; the task keeps running on
    /// its worker and its late settlement is discarded.
    pub async fn get(self, deadline: Option<Instant>) -> Settled {
        let awaited = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.rx).await {
                Ok(settled) => settled,
                Err(_) => return Err(CodeError::timeout("deadline exceeded awaiting fn result")),
            },
            None => self.rx.await,
        };
        match awaited {
            Ok(settled) => settled,
            Err(_) => Err(CodeError::internal("fn task dropped its promise")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn settles_with_success() {
        let (promise, future) = pair();
        promise.succeed(FnResponse::empty());
        assert!(future.get(None).await.is_ok());
    }

    #[tokio::test]
    async fn deadline_expiry_is_timeout() {
        let (promise, future) = pair();
        let deadline = Instant::now() + Duration::from_millis(20);
        let err = future.get(Some(deadline)).await.unwrap_err();
        assert_eq!(err.code(), 408);
        drop(promise);
    }

    #[tokio::test]
    async fn dropped_promise_is_internal() {
        let (promise, future) = pair();
        drop(promise);
        let err = future.get(None).await.unwrap_err();
        assert_eq!(err.code(), 500);
    }
}
