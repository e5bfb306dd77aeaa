//! Real-time replay of a recorded tick history.
//!
//! Every subscriber gets its own bounded channel and its own ordered copy of
//! the feed. A single delivery loop wakes on a fixed cadence and releases all
//! ticks whose recorded timestamp has passed. Ticks already in the past when
//! the loop starts are released on its first wake-up.

pub mod clock;
pub mod loader;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::FeedConfig;
use crate::feed::clock::ReplayClock;
use crate::feed::loader::LoadOptions;
use crate::models::Tick;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("tick history is empty")]
    Empty,
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {reason}")]
    Parse { path: String, line: usize, reason: String },
    #[error("invalid utc offset {0}h")]
    Offset(i32),
    #[error("feed delivery already started")]
    AlreadyStarted,
}

pub type TickReceiver = mpsc::Receiver<Tick>;

#[derive(Debug)]
pub struct TickFeed {
    pending: Mutex<VecDeque<Tick>>,
    subscribers: Mutex<Vec<mpsc::Sender<Tick>>>,
    closed: AtomicBool,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    cadence: Duration,
    buffer: usize,
}

impl TickFeed {
    /// `ticks` must already be sorted by timestamp.
    pub fn new(ticks: Vec<Tick>, cadence: Duration, buffer: usize) -> Result<Self, FeedError> {
        if ticks.is_empty() {
            return Err(FeedError::Empty);
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            pending: Mutex::new(ticks.into()),
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            shutdown,
            cadence,
            buffer: buffer.max(1),
        })
    }

    pub fn from_config(config: &FeedConfig) -> Result<Self, FeedError> {
        let ticks = loader::load_files(
            &config.files,
            LoadOptions {
                rebase_to_today: config.rebase_to_today,
                utc_offset_hours: config.utc_offset_hours,
            },
        )?;
        info!(ticks = ticks.len(), "historical data load completed");
        Self::new(ticks, config.cadence(), config.subscriber_buffer)
    }

    /// Registers a new delivery channel. After `close` the returned receiver
    /// is already closed.
    pub fn subscribe(&self) -> TickReceiver {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut subscribers = self.subscribers.lock();
        if !self.closed.load(Ordering::Acquire) {
            subscribers.push(tx);
        }
        rx
    }

    /// Subscribers whose receiver is still alive.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().iter().filter(|sender| !sender.is_closed()).count()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawns the delivery loop. Only the first call succeeds.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, FeedError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(FeedError::AlreadyStarted);
        }
        let feed = Arc::clone(self);
        let clock = ReplayClock::start();
        info!(pending = self.pending(), cadence_ms = self.cadence.as_millis() as u64, "starting tick feed");
        Ok(tokio::spawn(async move { feed.run(clock).await }))
    }

    /// Closes every subscriber channel and stops the delivery loop.
    pub fn close(&self) {
        {
            let mut subscribers = self.subscribers.lock();
            self.closed.store(true, Ordering::Release);
            subscribers.clear();
        }
        self.shutdown.send_replace(true);
        info!("tick feed closed");
    }

    async fn run(self: Arc<Self>, clock: ReplayClock) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.cadence);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|closed| *closed) => break,
            }
            if self.is_closed() {
                break;
            }
            let due = self.take_due(clock.now());
            if !due.is_empty() {
                self.deliver(due, &mut shutdown).await;
            }
            if self.pending.lock().is_empty() {
                info!("tick history exhausted");
                break;
            }
        }
    }

    fn take_due(&self, now: DateTime<Utc>) -> Vec<Tick> {
        let mut pending = self.pending.lock();
        let due = pending.iter().take_while(|tick| tick.timestamp <= now).count();
        pending.drain(..due).collect()
    }

    async fn deliver(&self, due: Vec<Tick>, shutdown: &mut watch::Receiver<bool>) {
        let senders = self.subscribers.lock().clone();
        debug!(ticks = due.len(), subscribers = senders.len(), "releasing ticks");
        for tick in &due {
            for sender in &senders {
                if sender.is_closed() {
                    continue;
                }
                tokio::select! {
                    _ = sender.send(tick.clone()) => {}
                    _ = shutdown.wait_for(|closed| *closed) => return,
                }
            }
        }
        metrics::counter!(crate::metrics::TICKS_DELIVERED).increment(due.len() as u64);
        self.subscribers.lock().retain(|sender| !sender.is_closed());
    }
}
