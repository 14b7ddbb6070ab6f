//! Keep-alive: ages idle connections and probes them with pings.
//!
//! Every tick each attached token's idle counter goes up; any received frame
//! resets it. A token whose counter reaches the interval gets one ping. A pong
//! puts it back to idle, a ping that times out disconnects it. The timer task
//! only runs while at least one token is attached.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::connection::Token;
use crate::error::NetError;
use crate::{mux_debug, mux_info, mux_warn};

const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PingOptions {
    pub fn tick(&self) -> Duration {
        (self.interval / 8).max(MIN_TICK)
    }

    /// Idle ticks after which a ping is due.
    pub fn threshold(&self) -> u32 {
        let tick = self.tick().as_nanos();
        let ticks = self.interval.as_nanos().div_ceil(tick);
        ticks.clamp(1, u32::MAX as u128) as u32
    }
}

pub struct PingOperator<M: Send + 'static> {
    opts: PingOptions,
    tokens: DashMap<Uuid, Arc<Token<M>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Send + 'static> PingOperator<M> {
    pub fn new(opts: PingOptions) -> Self {
        Self { opts, tokens: DashMap::new(), timer: Mutex::new(None) }
    }

    #[inline] pub fn options(&self) -> PingOptions { self.opts }
    #[inline] pub fn len(&self) -> usize           { self.tokens.len() }
    #[inline] pub fn is_empty(&self) -> bool       { self.tokens.is_empty() }

    pub fn is_running(&self) -> bool {
        self.timer().is_some()
    }

    /// Starts watching `token`; the first attachment starts the timer.
    pub fn attach(self: &Arc<Self>, token: Arc<Token<M>>) {
        let mut timer = self.timer();
        self.tokens.insert(token.id(), token);
        if timer.is_none() {
            mux_info!("Keep-alive started (interval {:?}, tick {:?})", self.opts.interval, self.opts.tick());
            *timer = Some(self.start());
        }
    }

    /// Stops watching a token; the last detachment stops the timer.
    pub fn detach(&self, id: Uuid) {
        let mut timer = self.timer();
        self.tokens.remove(&id);
        if self.tokens.is_empty() {
            if let Some(handle) = timer.take() {
                handle.abort();
                mux_info!("Keep-alive stopped, no connections left");
            }
        }
    }

    fn timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let operator: Weak<Self> = Arc::downgrade(self);
        let tick = self.opts.tick();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(operator) = operator.upgrade() else {
                    break;
                };
                operator.scan();
            }
        })
    }

    fn scan(&self) {
        let threshold = self.opts.threshold();
        let due: Vec<Arc<Token<M>>> = self
            .tokens
            .iter()
            .filter(|entry| entry.value().is_connected())
            .filter(|entry| entry.value().tick_idle() >= threshold && entry.value().begin_ping())
            .map(|entry| entry.value().clone())
            .collect();

        for token in due {
            token.touch();
            tokio::spawn(probe(token, self.opts.timeout));
        }
    }
}

impl<M: Send + 'static> Drop for PingOperator<M> {
    fn drop(&mut self) {
        if let Some(handle) = self.timer().take() {
            handle.abort();
        }
    }
}

async fn probe<M: Send + 'static>(token: Arc<Token<M>>, timeout: Duration) {
    mux_debug!("Pinging idle connection {} ({})", token.id(), token.remote_addr());
    match token.ping(timeout).await {
        Ok(rtt) => {
            mux_debug!("Pong from {} after {:?}", token.remote_addr(), rtt);
            token.touch();
        }
        Err(NetError::Timeout) => {
            mux_warn!("No pong from {} within {:?}, disconnecting", token.remote_addr(), timeout);
            token.disconnect();
        }
        Err(e) => mux_debug!("Ping to {} failed: {}", token.remote_addr(), e),
    }
    token.end_ping();
}
