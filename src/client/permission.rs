#[cfg(test)]
mod permission_test;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use portable_atomic::{AtomicBool, AtomicU64};
use stun::agent::*;
use stun::fingerprint::*;
use stun::message::*;
use stun::textattrs::Software;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::allocation::{check_response, MAX_RETRY_ATTEMPTS};
use super::auth::AuthState;
use super::binding::{BindingManager, BindingState};
use super::transaction::Transactor;
use crate::error::*;
use crate::proto::chandata::ChannelData;
use crate::proto::channum::ChannelNumber;
use crate::proto::data::Data;
use crate::proto::peeraddr::PeerAddress;

const MAX_READ_QUEUE_SIZE: usize = 1024;

/// Shared inbound state of one permission: the demultiplexer produces
/// into the queue, the owning [`Permission`] consumes from it.
pub(crate) struct PermissionInner {
    peer: SocketAddr,
    queue: Mutex<VecDeque<Vec<u8>>>,
    readable: Notify,
    dropped: AtomicU64,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    closed: CancellationToken,
    lost: AtomicBool,
}

impl PermissionInner {
    pub(crate) fn new(peer: SocketAddr, closed: CancellationToken) -> Self {
        PermissionInner {
            peer,
            queue: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            dropped: AtomicU64::new(0),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            closed,
            lost: AtomicBool::new(false),
        }
    }

    /// Appends an inbound datagram. When the queue is full the oldest
    /// datagram is discarded; datagram loss is a legitimate TURN
    /// semantic and only bumps a counter.
    pub(crate) async fn enqueue(&self, data: &[u8]) {
        if self.closed.is_cancelled() {
            return;
        }

        let mut queue = self.queue.lock().await;
        if queue.len() >= MAX_READ_QUEUE_SIZE {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::SeqCst);
            log::warn!("receive buffer full for {}, dropping oldest", self.peer);
        }
        queue.push_back(data.to_vec());
        drop(queue);

        self.readable.notify_one();
    }

    /// Marks the conduit dead due to transport loss and wakes readers.
    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
        self.closed.cancel();
    }

    /// Closes the conduit and wakes readers.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    fn close_error(&self) -> Error {
        if self.lost.load(Ordering::SeqCst) {
            Error::ErrConnectionLost
        } else {
            Error::ErrClosed
        }
    }
}

/// Permission map of an allocation, keyed by the peer address.
#[derive(Default)]
pub(crate) struct PermissionMap {
    perm_map: HashMap<String, Arc<PermissionInner>>,
}

impl PermissionMap {
    pub(crate) fn new() -> PermissionMap {
        PermissionMap {
            perm_map: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, addr: &SocketAddr, p: Arc<PermissionInner>) {
        self.perm_map.insert(addr.to_string(), p);
    }

    pub(crate) fn find(&self, addr: &SocketAddr) -> Option<&Arc<PermissionInner>> {
        self.perm_map.get(&addr.to_string())
    }

    pub(crate) fn delete(&mut self, addr: &SocketAddr) {
        self.perm_map.remove(&addr.to_string());
    }

    pub(crate) fn addrs(&self) -> Vec<SocketAddr> {
        self.perm_map.values().map(|p| p.peer).collect()
    }

    /// Closes every permission and empties the map. `lost` selects
    /// whether readers observe `ErrConnectionLost` or `ErrClosed`.
    pub(crate) fn close_all(&mut self, lost: bool) {
        for p in self.perm_map.values() {
            if lost {
                p.mark_lost();
            } else {
                p.close();
            }
        }
        self.perm_map.clear();
    }

    pub(crate) fn size(&self) -> usize {
        self.perm_map.len()
    }
}

/// `Permission` is a point-to-point conduit to a single peer behind the
/// relay. Reads drain the bounded inbound queue fed by the
/// demultiplexer; writes go out as Send indications, or as ChannelData
/// frames once [`Permission::bind`] has installed a channel.
pub struct Permission {
    inner: Arc<PermissionInner>,
    obs: Arc<dyn Transactor + Send + Sync>,
    auth: Arc<Mutex<AuthState>>,
    software: Option<Software>,
    perm_map: Arc<Mutex<PermissionMap>>,
    binding_mgr: Arc<Mutex<BindingManager>>,
}

impl Permission {
    pub(crate) fn new(
        inner: Arc<PermissionInner>,
        obs: Arc<dyn Transactor + Send + Sync>,
        auth: Arc<Mutex<AuthState>>,
        software: Option<Software>,
        perm_map: Arc<Mutex<PermissionMap>>,
        binding_mgr: Arc<Mutex<BindingManager>>,
    ) -> Self {
        Permission {
            inner,
            obs,
            auth,
            software,
            perm_map,
            binding_mgr,
        }
    }

    /// Returns the peer this conduit is bound to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Number of inbound datagrams discarded due to backpressure.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    /// Sets the absolute deadline for subsequent [`Permission::read`]
    /// calls. `None` disables the deadline.
    pub async fn set_read_deadline(&self, deadline: Option<Instant>) {
        let mut d = self.inner.read_deadline.lock().await;
        *d = deadline;
    }

    /// Sets the absolute deadline for subsequent [`Permission::write`]
    /// calls. `None` disables the deadline.
    pub async fn set_write_deadline(&self, deadline: Option<Instant>) {
        let mut d = self.inner.write_deadline.lock().await;
        *d = deadline;
    }

    /// Receives the next datagram from the peer, copying it into `buf`.
    /// Blocks until data arrives, the read deadline fires
    /// (`ErrTimeout`), or the conduit is closed (`ErrClosed`, or
    /// `ErrConnectionLost` after transport death). Datagrams queued
    /// before a close are still drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let deadline = *self.inner.read_deadline.lock().await;

        loop {
            let readable = self.inner.readable.notified();

            {
                let mut queue = self.inner.queue.lock().await;
                if let Some(data) = queue.pop_front() {
                    if buf.len() < data.len() {
                        return Err(Error::ErrShortBuffer);
                    }
                    buf[..data.len()].copy_from_slice(&data);
                    return Ok(data.len());
                }
            }

            if self.inner.closed.is_cancelled() {
                return Err(self.inner.close_error());
            }

            tokio::select! {
                biased;

                _ = self.inner.closed.cancelled() => {
                    return Err(self.inner.close_error());
                }
                _ = wait_deadline(deadline) => {
                    return Err(Error::ErrTimeout);
                }
                _ = readable => {}
            }
        }
    }

    /// Sends `data` to the peer. A ready channel binding upgrades the
    /// frame to ChannelData; otherwise the payload travels as a Send
    /// indication. Never blocks on a STUN transaction; the write
    /// deadline bounds only the transport write.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.inner.closed.is_cancelled() {
            return Err(self.inner.close_error());
        }

        let deadline = *self.inner.write_deadline.lock().await;

        let number = {
            let binding_mgr = self.binding_mgr.lock().await;
            binding_mgr
                .find_by_addr(&self.inner.peer)
                .filter(|b| {
                    b.state() == BindingState::Ready || b.state() == BindingState::Refreshing
                })
                .map(|b| b.number)
        };

        let raw = if let Some(number) = number {
            let mut ch_data = ChannelData {
                data: data.to_vec(),
                number: ChannelNumber(number),
                ..Default::default()
            };
            ch_data.encode();
            ch_data.raw
        } else {
            let mut msg = Message::new();
            msg.build(&[
                Box::new(TransactionId::new()),
                Box::new(MessageType::new(METHOD_SEND, CLASS_INDICATION)),
                Box::new(Data(data.to_vec())),
                Box::new(PeerAddress::from(self.inner.peer)),
                Box::new(FINGERPRINT),
            ])?;
            msg.raw
        };

        match deadline {
            Some(d) => match tokio::time::timeout_at(d, self.obs.indicate(&raw)).await {
                Ok(res) => res?,
                Err(_) => return Err(Error::ErrTimeout),
            },
            None => self.obs.indicate(&raw).await?,
        };

        Ok(data.len())
    }

    /// `true` once a channel binding is installed for this peer.
    pub async fn bound(&self) -> bool {
        let binding_mgr = self.binding_mgr.lock().await;
        matches!(
            binding_mgr.find_by_addr(&self.inner.peer).map(|b| b.state()),
            Some(BindingState::Ready) | Some(BindingState::Refreshing)
        )
    }

    /// The bound channel number, if any.
    pub async fn bound_channel(&self) -> Option<u16> {
        let binding_mgr = self.binding_mgr.lock().await;
        binding_mgr
            .find_by_addr(&self.inner.peer)
            .map(|b| b.number)
    }

    /// Installs a channel binding for this peer, upgrading the write
    /// path to ChannelData frames. Fails with `ErrAlreadyBound` when a
    /// binding exists and `ErrNoChannelsFree` when the number space is
    /// exhausted.
    pub async fn bind(&self) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Err(self.inner.close_error());
        }

        let number = {
            let mut binding_mgr = self.binding_mgr.lock().await;
            if binding_mgr.find_by_addr(&self.inner.peer).is_some() {
                return Err(Error::ErrAlreadyBound);
            }
            binding_mgr.create(self.inner.peer)?.number
        };

        let result = channel_bind(
            &self.obs,
            &self.auth,
            &self.software,
            self.inner.peer,
            number,
        )
        .await;

        let mut binding_mgr = self.binding_mgr.lock().await;
        match &result {
            Ok(()) => match binding_mgr.get_by_addr(&self.inner.peer) {
                Some(b) => {
                    b.set_state(BindingState::Ready);
                    b.set_refreshed_at(Instant::now());
                }
                // close() raced the bind and tore the entry down
                None => return Err(self.inner.close_error()),
            },
            Err(_) => {
                binding_mgr.delete_by_addr(&self.inner.peer);
            }
        }

        result
    }

    /// Closes the conduit. Idempotent: detaches from the allocation,
    /// tears down any channel binding and wakes a blocked read.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Ok(());
        }
        self.inner.close();

        {
            let mut perm_map = self.perm_map.lock().await;
            perm_map.delete(&self.inner.peer);
        }
        {
            let mut binding_mgr = self.binding_mgr.lock().await;
            binding_mgr.delete_by_addr(&self.inner.peer);
        }

        Ok(())
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Performs the ChannelBind transaction for `(peer, number)`, riding out
/// stale nonces.
pub(crate) async fn channel_bind(
    obs: &Arc<dyn Transactor + Send + Sync>,
    auth: &Arc<Mutex<AuthState>>,
    software: &Option<Software>,
    peer: SocketAddr,
    number: u16,
) -> Result<()> {
    let mut result = Ok(());
    for _ in 0..MAX_RETRY_ATTEMPTS {
        result = try_channel_bind(obs, auth, software, peer, number).await;
        match &result {
            Err(Error::ErrTryAgain) => continue,
            _ => break,
        }
    }
    result
}

async fn try_channel_bind(
    obs: &Arc<dyn Transactor + Send + Sync>,
    auth: &Arc<Mutex<AuthState>>,
    software: &Option<Software>,
    peer: SocketAddr,
    number: u16,
) -> Result<()> {
    let msg = {
        let auth_state = auth.lock().await;

        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_CHANNEL_BIND, CLASS_REQUEST)),
            Box::new(PeerAddress::from(peer)),
            Box::new(ChannelNumber(number)),
        ];
        if let Some(software) = software {
            setters.push(Box::new(software.clone()));
        }
        auth_state.sign(&mut setters);
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        msg.build(&setters)?;
        msg
    };

    let mut tr_res = obs.perform(&msg, false).await?;
    check_response(auth, &mut tr_res.msg, METHOD_CHANNEL_BIND).await?;

    log::debug!("channel binding successful: {peer} {number}");
    Ok(())
}
