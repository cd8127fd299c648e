// =============================================================================
// Alpine Sync — best-effort mirror of stored signals to an external receiver
// =============================================================================
//
// Fire-and-forget: `submit` never blocks and never fails the caller. A
// bounded channel feeds a background poster; failed deliveries go to a
// bounded retry queue that drains on a slow timer. When the receiver is
// down, signals are dropped oldest-first — the generator is never backed up.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::signal::Signal;

const CHANNEL_DEPTH: usize = 512;
const RETRY_DEPTH: usize = 1024;
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

pub struct AlpineSync {
    tx: mpsc::Sender<Signal>,
}

impl AlpineSync {
    /// Spawn the background poster and return the handle.
    pub fn spawn(
        endpoint_url: String,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Signal>(CHANNEL_DEPTH);
        let retry: Arc<Mutex<VecDeque<Signal>>> = Arc::new(Mutex::new(VecDeque::new()));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build sync http client");

        let retry_loop = retry.clone();
        let endpoint = endpoint_url.clone();
        tokio::spawn(async move {
            let mut retry_tick = tokio::time::interval(RETRY_INTERVAL);
            retry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    signal = rx.recv() => {
                        match signal {
                            Some(signal) => {
                                post_or_park(&http, &endpoint, signal, &retry_loop).await;
                            }
                            None => break,
                        }
                    }
                    _ = retry_tick.tick() => {
                        let batch: Vec<Signal> = {
                            let mut parked = retry_loop.lock();
                            parked.drain(..).collect()
                        };
                        for signal in batch {
                            post_or_park(&http, &endpoint, signal, &retry_loop).await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Arc::new(Self { tx })
    }

    /// Hand a signal to the forwarder. Drops silently when the channel is
    /// full — sync never applies back-pressure to the generator.
    pub fn submit(&self, signal: &Signal) {
        if self.tx.try_send(signal.clone()).is_err() {
            debug!(signal_id = %signal.signal_id, "sync channel full, signal dropped");
        }
    }
}

async fn post_or_park(
    http: &reqwest::Client,
    endpoint: &str,
    signal: Signal,
    retry: &Mutex<VecDeque<Signal>>,
) {
    let delivered = matches!(
        http.post(endpoint).json(&signal).send().await,
        Ok(response) if response.status().is_success()
    );
    if !delivered {
        let mut parked = retry.lock();
        if parked.len() >= RETRY_DEPTH {
            parked.pop_front();
            warn!("sync retry queue full, oldest signal dropped");
        }
        parked.push_back(signal);
    }
}
