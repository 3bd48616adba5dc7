
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use portable_atomic::AtomicU16;
use stun::agent::TransactionId;
use stun::message::*;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use util::Conn;

use crate::error::*;

const MAX_RTX_INTERVAL_FACTOR: u16 = 8; // backoff cap, in multiples of RTO
const MAX_RTX_COUNT: u16 = 7; // total 7 requests (Rc)

/// `Transactor` is the narrow capability every TURN operation runs
/// through: submit a request and wait for the matching response, or
/// fire an unacknowledged frame. The client engine provides the
/// built-in implementation; tests may inject their own.
#[async_trait]
pub trait Transactor {
    /// Performs a STUN transaction: registers `msg`, writes it to the
    /// wire with retransmissions, and resolves with the matching
    /// response, a timeout, or a cancellation. With `dont_wait` the
    /// request is sent once and the call returns immediately.
    async fn perform(&self, msg: &Message, dont_wait: bool) -> Result<TransactionResult>;

    /// Writes an already-encoded frame (a STUN indication or a
    /// ChannelData frame) to the server, fire-and-forget.
    async fn indicate(&self, data: &[u8]) -> Result<usize>;
}

fn tr_key(id: &TransactionId) -> String {
    BASE64_STANDARD.encode(id.0)
}

async fn on_rtx_timeout(
    conn: &Arc<dyn Conn + Send + Sync>,
    tr_map: &Arc<Mutex<TransactionMap>>,
    id: TransactionId,
    n_rtx: u16,
) -> bool {
    let mut tm = tr_map.lock().await;
    let (tr_raw, tr_to, no_retransmit) = match tm.get(&id) {
        Some(tr) => (tr.raw.clone(), tr.to, tr.no_retransmit),
        None => return true, // already gone
    };

    if n_rtx == MAX_RTX_COUNT {
        // all retransmissions failed
        if let Some(tr) = tm.delete(&id) {
            if !tr
                .write_result(TransactionResult {
                    err: Some(Error::ErrTimeout),
                    ..Default::default()
                })
                .await
            {
                log::debug!("no listener for transaction {}", tr_key(&id));
            }
        }
        return true;
    }

    if no_retransmit {
        // Reliable transports get the full deadline but no duplicate
        // frames.
        return false;
    }

    // The map lock is not held across the transport write.
    drop(tm);

    log::trace!(
        "retransmitting transaction {} to {tr_to} (n_rtx={n_rtx})",
        tr_key(&id)
    );

    if let Err(err) = conn.send_to(&tr_raw, tr_to).await {
        let mut tm = tr_map.lock().await;
        if let Some(tr) = tm.delete(&id) {
            if !tr
                .write_result(TransactionResult {
                    err: Some(Error::Util(err)),
                    ..Default::default()
                })
                .await
            {
                log::debug!("no listener for transaction {}", tr_key(&id));
            }
        }
        return true;
    }

    false
}

/// `TransactionResult` is a bag of result values of a transaction.
#[derive(Debug)]
pub struct TransactionResult {
    pub msg: Message,
    pub from: SocketAddr,
    pub retries: u16,
    pub err: Option<Error>,
}

impl Default for TransactionResult {
    fn default() -> Self {
        TransactionResult {
            msg: Message::default(),
            from: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 0),
            retries: 0,
            err: None,
        }
    }
}

/// `TransactionConfig` is a set of config params used by [`Transaction::new()`].
pub struct TransactionConfig {
    pub id: TransactionId,
    pub raw: Vec<u8>,
    pub to: SocketAddr,
    pub interval: u16, // initial RTO in msec
    pub ignore_result: bool, // true to throw away the result of this transaction
    pub no_retransmit: bool,
}

/// `Transaction` represents a pending STUN request.
#[derive(Debug)]
pub struct Transaction {
    pub id: TransactionId,
    pub raw: Vec<u8>,
    pub to: SocketAddr,
    pub n_rtx: Arc<AtomicU16>,
    pub interval: Arc<AtomicU16>,
    max_interval: u16,
    no_retransmit: bool,
    timer_ch_tx: Option<mpsc::Sender<()>>,
    result_ch_tx: Option<mpsc::Sender<TransactionResult>>,
    result_ch_rx: Option<mpsc::Receiver<TransactionResult>>,
}

impl Transaction {
    /// Creates a new [`Transaction`] using the given `config`.
    pub fn new(config: TransactionConfig) -> Self {
        let (result_ch_tx, result_ch_rx) = if !config.ignore_result {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        Transaction {
            id: config.id,
            raw: config.raw,
            to: config.to,
            n_rtx: Arc::new(AtomicU16::new(0)),
            interval: Arc::new(AtomicU16::new(config.interval)),
            max_interval: config.interval.saturating_mul(MAX_RTX_INTERVAL_FACTOR),
            no_retransmit: config.no_retransmit,
            timer_ch_tx: None,
            result_ch_tx,
            result_ch_rx,
        }
    }

    /// Starts the transaction timer.
    pub async fn start_rtx_timer(
        &mut self,
        conn: Arc<dyn Conn + Send + Sync>,
        tr_map: Arc<Mutex<TransactionMap>>,
    ) {
        let (timer_ch_tx, mut timer_ch_rx) = mpsc::channel(1);
        self.timer_ch_tx = Some(timer_ch_tx);
        let (id, n_rtx, interval) = (self.id, self.n_rtx.clone(), self.interval.clone());
        let max_interval = self.max_interval;

        tokio::spawn(async move {
            let mut done = false;
            while !done {
                let timer = tokio::time::sleep(Duration::from_millis(
                    interval.load(Ordering::SeqCst) as u64,
                ));
                tokio::pin!(timer);

                tokio::select! {
                    _ = timer.as_mut() => {
                        let rtx = n_rtx.fetch_add(1, Ordering::SeqCst);

                        let mut val = interval.load(Ordering::SeqCst);
                        val = val.saturating_mul(2);
                        if val > max_interval {
                            val = max_interval;
                        }
                        interval.store(val, Ordering::SeqCst);

                        done = on_rtx_timeout(&conn, &tr_map, id, rtx + 1).await;
                    }
                    _ = timer_ch_rx.recv() => done = true,
                }
            }
        });
    }

    /// Stops the transaction timer.
    pub fn stop_rtx_timer(&mut self) {
        if self.timer_ch_tx.is_some() {
            self.timer_ch_tx.take();
        }
    }

    /// Writes the result to the result channel.
    pub async fn write_result(&self, res: TransactionResult) -> bool {
        if let Some(result_ch) = &self.result_ch_tx {
            result_ch.send(res).await.is_ok()
        } else {
            false
        }
    }

    /// Returns the result channel.
    pub fn get_result_channel(&mut self) -> Option<mpsc::Receiver<TransactionResult>> {
        self.result_ch_rx.take()
    }

    /// Closes the transaction.
    pub fn close(&mut self) {
        if self.result_ch_tx.is_some() {
            self.result_ch_tx.take();
        }
    }

    /// Returns the number of retransmissions it has made.
    pub fn retries(&self) -> u16 {
        self.n_rtx.load(Ordering::SeqCst)
    }
}

/// The pending transactions of a client, indexed by transaction id.
#[derive(Default, Debug)]
pub struct TransactionMap {
    pending: HashMap<TransactionId, Transaction>,
}

impl TransactionMap {
    /// Create a new [`TransactionMap`].
    pub fn new() -> TransactionMap {
        TransactionMap::default()
    }

    /// Registers a pending [`Transaction`] under its own id.
    pub fn insert(&mut self, tr: Transaction) {
        self.pending.insert(tr.id, tr);
    }

    /// The pending [`Transaction`] for `id`, if any.
    pub fn get(&mut self, id: &TransactionId) -> Option<&mut Transaction> {
        self.pending.get_mut(id)
    }

    /// Removes and returns the pending [`Transaction`] for `id`.
    pub fn delete(&mut self, id: &TransactionId) -> Option<Transaction> {
        self.pending.remove(id)
    }

    /// Fails every pending [`Transaction`] with clones of `err` and
    /// clears the map. Used on shutdown (`ErrCanceled`) and transport
    /// death (`ErrConnectionLost`).
    pub async fn fail_all(&mut self, err: fn() -> Error) {
        for (id, mut tr) in self.pending.drain() {
            tr.stop_rtx_timer();
            if !tr
                .write_result(TransactionResult {
                    err: Some(err()),
                    ..Default::default()
                })
                .await
            {
                log::debug!("no listener for transaction {}", tr_key(&id));
            }
        }
    }

    /// Returns its length.
    pub fn size(&self) -> usize {
        self.pending.len()
    }
}
