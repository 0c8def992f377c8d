use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// Periodic clock driving a controller's heartbeat checks.
///
/// Injected so embedders can drive ticks from their own loop (or tests can
/// drive them by hand) instead of relying on a timer.
#[async_trait]
pub trait Ticker: Send {
    /// Resolves at the next tick
    async fn tick(&mut self);
}

/// Ticker backed by a tokio interval
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Ticker fired by hand through a [`TickSender`]
pub struct ChannelTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

#[derive(Clone)]
pub struct TickSender {
    tx: mpsc::UnboundedSender<()>,
}

impl TickSender {
    /// Fires one tick. Returns false once the ticker is gone.
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

pub fn channel_ticker() -> (TickSender, ChannelTicker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TickSender { tx }, ChannelTicker { rx })
}

#[async_trait]
impl Ticker for ChannelTicker {
    async fn tick(&mut self) {
        if self.rx.recv().await.is_none() {
            // Every sender dropped: no more ticks, ever
            std::future::pending::<()>().await;
        }
    }
}
