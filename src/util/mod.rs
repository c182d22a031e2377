//! Common utilities

use std::io;
use std::ops::Deref;
use std::{future::Future, pin::Pin, task::Poll, time::Duration};

use tokio::time::{Instant, Sleep};

/// Outcome of one turn of an engine event loop
#[derive(Debug)]
pub(crate) enum Running {
    Continue,
    Stop,
}

/// Tracks the remote peer's idle timeout. The timer is reset whenever a
/// frame is read off the transport.
#[derive(Debug)]
pub(crate) struct IdleTimeout {
    delay: Pin<Box<Sleep>>,
    duration: Duration,
}

impl IdleTimeout {
    pub fn new(duration: Duration) -> Self {
        let delay = Box::pin(tokio::time::sleep(duration));
        Self { delay, duration }
    }

    pub fn reset(&mut self) {
        let next = Instant::now() + self.duration;
        self.delay.as_mut().reset(next);
    }
}

impl Future for IdleTimeout {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let delay = Pin::new(&mut self.delay);
        delay.poll(cx).map(Ok)
    }
}

/// A field that is set once at construction and never mutated afterwards
#[derive(Debug)]
pub(crate) struct Constant<T> {
    value: T,
}

impl<T> Constant<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T> Deref for Constant<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

/// An armed deadline used for the open and close timeouts of the
/// connection engine. `OneshotDeadline::never()` never fires.
#[derive(Debug)]
pub(crate) struct OneshotDeadline {
    delay: Option<Pin<Box<Sleep>>>,
}

impl OneshotDeadline {
    pub fn never() -> Self {
        Self { delay: None }
    }

    pub fn after(duration: Duration) -> Self {
        Self {
            delay: Some(Box::pin(tokio::time::sleep(duration))),
        }
    }

    pub fn disarm(&mut self) {
        self.delay = None;
    }

    /// Resolves when the deadline fires; pending forever when disarmed
    pub async fn fired(&mut self) {
        match &mut self.delay {
            Some(delay) => delay.await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::OneshotDeadline;

    #[tokio::test]
    async fn disarmed_deadline_never_fires() {
        let mut deadline = OneshotDeadline::never();
        let result =
            tokio::time::timeout(Duration::from_millis(10), deadline.fired()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn armed_deadline_fires() {
        let mut deadline = OneshotDeadline::after(Duration::from_millis(1));
        let result =
            tokio::time::timeout(Duration::from_millis(100), deadline.fired()).await;
        assert!(result.is_ok());
    }
}
