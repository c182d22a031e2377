//! Emits empty frames on the cadence demanded by the remote peer's
//! idle-time-out

use std::{
    task::{Context, Poll},
    time::Duration,
};

use futures_util::Stream;
use tokio::time::{Interval, MissedTickBehavior};

/// A stream that ticks once per heartbeat period, or never when the remote
/// peer did not request an idle timeout
#[derive(Debug)]
pub struct HeartBeat {
    interval: Option<Interval>,
}

impl HeartBeat {
    /// A [`HeartBeat`] that never yields
    pub fn never() -> Self {
        Self { interval: None }
    }

    /// A [`HeartBeat`] ticking per the given period
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval: Some(interval),
        }
    }
}

impl Stream for HeartBeat {
    type Item = ();

    fn poll_next(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().interval {
            Some(interval) => match interval.poll_tick(cx) {
                Poll::Ready(_instant) => Poll::Ready(Some(())),
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::HeartBeat;

    #[tokio::test]
    async fn never_heartbeat_stays_pending() {
        let mut heartbeat = HeartBeat::never();
        let result = tokio::time::timeout(Duration::from_millis(10), heartbeat.next()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn periodic_heartbeat_ticks() {
        let mut heartbeat = HeartBeat::new(Duration::from_millis(1));
        let result = tokio::time::timeout(Duration::from_millis(100), heartbeat.next()).await;
        assert!(result.is_ok());
    }
}
