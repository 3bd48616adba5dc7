#[cfg(test)]
mod allocation_test;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use stun::agent::*;
use stun::error_code::*;
use stun::fingerprint::*;
use stun::message::*;
use stun::textattrs::Software;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::auth::AuthState;
use super::binding::{BindingManager, BindingState};
use super::periodic_timer::*;
use super::permission::{channel_bind, Permission, PermissionInner, PermissionMap};
use super::transaction::Transactor;
use crate::error::*;
use crate::proto::lifetime::Lifetime;
use crate::proto::peeraddr::PeerAddress;
use crate::proto::{Protocol, PROTO_UDP};

// Permissions expire after 300 s, channel bindings after 600 s; both
// are re-installed one minute ahead of expiry.
pub(crate) const PERM_REFRESH_INTERVAL: Duration = Duration::from_secs(240);
pub(crate) const BINDING_REFRESH_INTERVAL: Duration = Duration::from_secs(540);
pub(crate) const MAX_RETRY_ATTEMPTS: u16 = 3;

/// `AllocationConfig` is the outcome of a successful Allocate
/// transaction, used to assemble an [`Allocation`].
pub(crate) struct AllocationConfig {
    pub(crate) relayed_addr: SocketAddr,
    pub(crate) reflexive_addr: Option<SocketAddr>,
    pub(crate) lifetime: Duration,
    pub(crate) auth: Arc<Mutex<AuthState>>,
    pub(crate) software: Option<Software>,
    pub(crate) perm_map: Arc<Mutex<PermissionMap>>,
    pub(crate) binding_mgr: Arc<Mutex<BindingManager>>,
    pub(crate) refresh_interval: Option<Duration>,
    pub(crate) close_notify: CancellationToken,
}

/// `Allocation` is a relay lease granted by the server: it owns the
/// per-peer permissions, keeps the lease and its permissions refreshed,
/// and hands out [`Permission`] conduits.
pub struct Allocation {
    relayed_addr: SocketAddr,
    reflexive_addr: Option<SocketAddr>,
    internal: Arc<Mutex<AllocationInternal>>,
    obs: Arc<dyn Transactor + Send + Sync>,
    auth: Arc<Mutex<AuthState>>,
    software: Option<Software>,
    perm_map: Arc<Mutex<PermissionMap>>,
    binding_mgr: Arc<Mutex<BindingManager>>,
    refresh_alloc_timer: PeriodicTimer,
    refresh_perms_timer: PeriodicTimer,
    refresh_binds_timer: PeriodicTimer,
    close_notify: CancellationToken,
}

pub(crate) struct AllocationInternal {
    obs: Arc<dyn Transactor + Send + Sync>,
    auth: Arc<Mutex<AuthState>>,
    software: Option<Software>,
    perm_map: Arc<Mutex<PermissionMap>>,
    binding_mgr: Arc<Mutex<BindingManager>>,
    lifetime: Duration,
    expires_at: Instant,
    dead: bool,
}

impl Allocation {
    /// Creates a new [`Allocation`] and arms its refresh timers.
    pub(crate) async fn new(
        obs: Arc<dyn Transactor + Send + Sync>,
        config: AllocationConfig,
    ) -> Self {
        log::debug!("initial lifetime: {} seconds", config.lifetime.as_secs());

        let internal = AllocationInternal {
            obs: Arc::clone(&obs),
            auth: Arc::clone(&config.auth),
            software: config.software.clone(),
            perm_map: Arc::clone(&config.perm_map),
            binding_mgr: Arc::clone(&config.binding_mgr),
            lifetime: config.lifetime,
            expires_at: Instant::now() + config.lifetime,
            dead: false,
        };

        let a = Allocation {
            relayed_addr: config.relayed_addr,
            reflexive_addr: config.reflexive_addr,
            internal: Arc::new(Mutex::new(internal)),
            obs,
            auth: config.auth,
            software: config.software,
            perm_map: config.perm_map,
            binding_mgr: config.binding_mgr,
            refresh_alloc_timer: PeriodicTimer::new(
                TimerIdRefresh::Alloc,
                config.refresh_interval.unwrap_or(config.lifetime / 2),
            ),
            refresh_perms_timer: PeriodicTimer::new(TimerIdRefresh::Perms, PERM_REFRESH_INTERVAL),
            refresh_binds_timer: PeriodicTimer::new(
                TimerIdRefresh::Binds,
                BINDING_REFRESH_INTERVAL,
            ),
            close_notify: config.close_notify,
        };

        if config.refresh_interval.is_some()
            && a.refresh_alloc_timer
                .start(Arc::clone(&a.internal), a.close_notify.clone())
                .await
        {
            log::debug!("refresh_alloc_timer started");
        }
        if a.refresh_perms_timer
            .start(Arc::clone(&a.internal), a.close_notify.clone())
            .await
        {
            log::debug!("refresh_perms_timer started");
        }
        if a.refresh_binds_timer
            .start(Arc::clone(&a.internal), a.close_notify.clone())
            .await
        {
            log::debug!("refresh_binds_timer started");
        }

        a
    }

    /// The relayed transport address the server allocated.
    pub fn relayed_addr(&self) -> SocketAddr {
        self.relayed_addr
    }

    /// The client's server-reflexive address, when the server reported
    /// one.
    pub fn reflexive_addr(&self) -> Option<SocketAddr> {
        self.reflexive_addr
    }

    /// The current lease lifetime.
    pub async fn lifetime(&self) -> Duration {
        let internal = self.internal.lock().await;
        internal.lifetime
    }

    /// Installs a permission for `peer` over the given transport
    /// protocol. Only UDP peers are relayable; anything else fails with
    /// `ErrUnsupportedPeerType`.
    pub async fn create(&self, protocol: Protocol, peer: SocketAddr) -> Result<Permission> {
        if protocol != PROTO_UDP {
            return Err(Error::ErrUnsupportedPeerType);
        }
        self.create_udp(peer).await
    }

    /// Installs a permission for the UDP peer `peer` and returns its
    /// conduit.
    pub async fn create_udp(&self, peer: SocketAddr) -> Result<Permission> {
        if self.close_notify.is_cancelled() {
            return Err(Error::ErrClosed);
        }
        {
            let internal = self.internal.lock().await;
            if internal.dead {
                return Err(Error::ErrAllocationDead);
            }
        }
        {
            let perm_map = self.perm_map.lock().await;
            if perm_map.find(&peer).is_some() {
                return Err(Error::ErrPermissionExists);
            }
        }

        let mut result = Ok(());
        for _ in 0..MAX_RETRY_ATTEMPTS {
            result = create_permissions(&self.obs, &self.auth, &self.software, &[peer]).await;
            match &result {
                Err(Error::ErrTryAgain) => continue,
                _ => break,
            }
        }
        result?;

        let inner = Arc::new(PermissionInner::new(peer, self.close_notify.child_token()));
        {
            let mut perm_map = self.perm_map.lock().await;
            if perm_map.find(&peer).is_some() {
                return Err(Error::ErrPermissionExists);
            }
            perm_map.insert(&peer, Arc::clone(&inner));
        }

        Ok(Permission::new(
            inner,
            Arc::clone(&self.obs),
            Arc::clone(&self.auth),
            self.software.clone(),
            Arc::clone(&self.perm_map),
            Arc::clone(&self.binding_mgr),
        ))
    }

    /// Releases the lease: stops the refresh timers, closes every
    /// permission and tells the server to drop the allocation
    /// (Refresh with lifetime 0, best-effort).
    pub async fn close(&self) -> Result<()> {
        let mut internal = self.internal.lock().await;
        if self.close_notify.is_cancelled() {
            return Ok(());
        }
        self.close_notify.cancel();
        internal.dead = true;

        self.refresh_alloc_timer.stop().await;
        self.refresh_perms_timer.stop().await;
        self.refresh_binds_timer.stop().await;

        {
            let mut perm_map = self.perm_map.lock().await;
            perm_map.close_all(false);
        }
        {
            let mut binding_mgr = self.binding_mgr.lock().await;
            binding_mgr.clear();
        }

        let _ = internal
            .refresh_allocation(Duration::from_secs(0), true /* dont_wait */)
            .await;
        Ok(())
    }
}

impl AllocationInternal {
    async fn refresh_allocation(&mut self, lifetime: Duration, dont_wait: bool) -> Result<()> {
        let msg = {
            let auth_state = self.auth.lock().await;

            let mut setters: Vec<Box<dyn Setter>> = vec![
                Box::new(TransactionId::new()),
                Box::new(MessageType::new(METHOD_REFRESH, CLASS_REQUEST)),
                Box::new(Lifetime(lifetime)),
            ];
            if let Some(software) = &self.software {
                setters.push(Box::new(software.clone()));
            }
            auth_state.sign(&mut setters);
            setters.push(Box::new(FINGERPRINT));

            let mut msg = Message::new();
            msg.build(&setters)?;
            msg
        };

        log::debug!("send refresh request (dont_wait={dont_wait})");
        let mut tr_res = self.obs.perform(&msg, dont_wait).await?;

        if dont_wait {
            log::debug!("refresh request sent");
            return Ok(());
        }

        check_response(&self.auth, &mut tr_res.msg, METHOD_REFRESH).await?;

        // Getting lifetime from response
        let mut updated_lifetime = Lifetime::default();
        if updated_lifetime.get_from(&tr_res.msg).is_ok() {
            self.lifetime = updated_lifetime.0;
        }
        self.expires_at = Instant::now() + self.lifetime;

        log::debug!("updated lifetime: {} seconds", self.lifetime.as_secs());
        Ok(())
    }

    async fn refresh_permissions(&mut self) -> Result<()> {
        let addrs = {
            let perm_map = self.perm_map.lock().await;
            perm_map.addrs()
        };
        if addrs.is_empty() {
            log::debug!("no permission to refresh");
            return Ok(());
        }

        create_permissions(&self.obs, &self.auth, &self.software, &addrs).await?;

        log::debug!("refresh permissions successful");
        Ok(())
    }

    async fn refresh_bindings(&mut self) {
        let bindings: Vec<(SocketAddr, u16)> = {
            let mut binding_mgr = self.binding_mgr.lock().await;
            let ready: Vec<(SocketAddr, u16)> = binding_mgr
                .addrs()
                .iter()
                .filter_map(|addr| {
                    binding_mgr
                        .find_by_addr(addr)
                        .filter(|b| b.state() == BindingState::Ready)
                        .map(|b| (b.addr, b.number))
                })
                .collect();
            for (addr, _) in &ready {
                if let Some(b) = binding_mgr.get_by_addr(addr) {
                    b.set_state(BindingState::Refreshing);
                }
            }
            ready
        };

        for (addr, number) in bindings {
            let result =
                channel_bind(&self.obs, &self.auth, &self.software, addr, number).await;

            let mut binding_mgr = self.binding_mgr.lock().await;
            match result {
                Ok(()) => {
                    if let Some(b) = binding_mgr.get_by_addr(&addr) {
                        b.set_refreshed_at(Instant::now());
                        b.set_state(BindingState::Ready);
                    }
                }
                Err(err) => {
                    // The permission stays usable via indications.
                    log::warn!("channel bind refresh for {addr} failed: {err}");
                    binding_mgr.delete_by_addr(&addr);
                }
            }
        }
    }

    async fn mark_dead(&mut self) {
        log::warn!("allocation lease expired, marking dead");
        self.dead = true;
        {
            let mut perm_map = self.perm_map.lock().await;
            perm_map.close_all(false);
        }
        {
            let mut binding_mgr = self.binding_mgr.lock().await;
            binding_mgr.clear();
        }
    }
}

#[async_trait]
impl PeriodicTimerTimeoutHandler for AllocationInternal {
    async fn on_timeout(&mut self, id: TimerIdRefresh) {
        log::debug!("refresh timer {id:?} expired");
        if self.dead {
            return;
        }

        match id {
            TimerIdRefresh::Alloc => {
                let lifetime = self.lifetime;
                // a stale nonce answer should succeed on the retry
                let mut result = Ok(());
                for _ in 0..MAX_RETRY_ATTEMPTS {
                    result = self.refresh_allocation(lifetime, false).await;
                    match &result {
                        Err(Error::ErrTryAgain) => continue,
                        _ => break,
                    }
                }
                if let Err(err) = result {
                    log::warn!("refresh allocation failed: {err}");
                    if Instant::now() >= self.expires_at {
                        self.mark_dead().await;
                    }
                }
            }
            TimerIdRefresh::Perms => {
                let mut result = Ok(());
                for _ in 0..MAX_RETRY_ATTEMPTS {
                    result = self.refresh_permissions().await;
                    match &result {
                        Err(Error::ErrTryAgain) => continue,
                        _ => break,
                    }
                }
                if let Err(err) = result {
                    log::warn!("refresh permissions failed: {err}");
                }
            }
            TimerIdRefresh::Binds => {
                self.refresh_bindings().await;
            }
        }
    }
}

/// Issues a CreatePermission request covering every address in `addrs`.
pub(crate) async fn create_permissions(
    obs: &Arc<dyn Transactor + Send + Sync>,
    auth: &Arc<Mutex<AuthState>>,
    software: &Option<Software>,
    addrs: &[SocketAddr],
) -> Result<()> {
    let msg = {
        let auth_state = auth.lock().await;

        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_CREATE_PERMISSION, CLASS_REQUEST)),
        ];
        for addr in addrs {
            setters.push(Box::new(PeerAddress::from(*addr)));
        }
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
    check_response(auth, &mut tr_res.msg, METHOD_CREATE_PERMISSION).await
}

/// Classifies a transaction response: converts error responses into
/// `ErrServer` (or `ErrTryAgain` for a stale nonce, after updating the
/// cached nonce), rejects method mismatches, and verifies
/// MESSAGE-INTEGRITY on success responses of authenticated sessions.
pub(crate) async fn check_response(
    auth: &Arc<Mutex<AuthState>>,
    res: &mut Message,
    method: Method,
) -> Result<()> {
    if res.typ.class == CLASS_ERROR_RESPONSE {
        let mut code = ErrorCodeAttribute::default();
        if code.get_from(res).is_err() {
            return Err(Error::Other(format!("{}", res.typ)));
        }
        if code.code == CODE_STALE_NONCE {
            let mut auth_state = auth.lock().await;
            auth_state.update_nonce(res);
            return Err(Error::ErrTryAgain);
        }
        return Err(Error::ErrServer {
            code: code.code.0,
            reason: String::from_utf8_lossy(&code.reason).to_string(),
        });
    }

    if res.typ.method != method {
        return Err(Error::ErrUnexpectedResponse);
    }

    let auth_state = auth.lock().await;
    auth_state.verify(res)
}
