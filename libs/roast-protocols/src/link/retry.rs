//! Bounded retry on an injected clock

use futures::future::BoxFuture;
use roast_comlink::Clock;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Why [`with_retries`] gave up
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed; `last` is the error of the final one
    Exhausted { attempts: u32, last: E },
    /// `retry_if` rejected the error; no further attempts were made
    Aborted(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted(err) => err,
        }
    }
}

/// Run `op` up to `retries + 1` times
///
/// `op` receives the shared `state` and the 1-based attempt number. Between
/// attempts the combinator waits `delay` on `clock`. Errors for which
/// `retry_if` returns false end the loop immediately.
pub async fn with_retries<S, T, E, R, F>(
    retries: u32,
    delay: Duration,
    clock: &dyn Clock,
    state: &mut S,
    mut retry_if: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    S: Send + ?Sized,
    E: fmt::Display,
    R: FnMut(&E) -> bool,
    F: for<'s> FnMut(&'s mut S, u32) -> BoxFuture<'s, Result<T, E>>,
{
    let attempts = retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        match op(&mut *state, attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !retry_if(&err) => return Err(RetryError::Aborted(err)),
            Err(err) if attempt >= attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                })
            },
            Err(err) => {
                warn!("Attempt {}/{} failed: {}", attempt, attempts, err);
                if !delay.is_zero() {
                    clock.sleep(delay).await;
                }
                attempt += 1;
            },
        }
    }
}
