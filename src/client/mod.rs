
pub mod allocation;
pub mod auth;
pub mod binding;
pub mod periodic_timer;
pub mod permission;
pub mod transaction;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use allocation::*;
use async_trait::async_trait;
use auth::AuthState;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use binding::BindingManager;
use permission::PermissionMap;
use portable_atomic::AtomicBool;
use stun::agent::*;
use stun::attributes::*;
use stun::error_code::*;
use stun::fingerprint::*;
use stun::message::*;
use stun::textattrs::*;
use stun::xoraddr::*;
use tokio::pin;
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use transaction::*;
use util::conn::*;

use crate::error::*;
use crate::proto::chandata::ChannelData;
use crate::proto::data::Data;
use crate::proto::lifetime::{Lifetime, DEFAULT_LIFETIME};
use crate::proto::peeraddr::PeerAddress;
use crate::proto::relayaddr::RelayedAddress;
use crate::proto::reqtrans::RequestedTransport;
use crate::proto::PROTO_UDP;

const DEFAULT_RTO_IN_MS: u16 = 100;
const MAX_DATA_BUFFER_SIZE: usize = u16::MAX as usize; // message size limit for Chromium

/// `ClientConfig` is a bag of config parameters for [`Client`].
pub struct ClientConfig {
    pub stun_serv_addr: String, // STUN server address (e.g. "stun.abc.com:3478")
    pub turn_serv_addr: String, // TURN server address (e.g. "turn.abc.com:3478")
    pub username: String,
    pub password: String,
    pub realm: String,
    pub software: String,
    pub rto_in_ms: u16,
    /// Disables request retransmission, for reliable transports. The
    /// overall transaction deadline is unchanged.
    pub no_retransmit: bool,
    /// Allocation refresh period. `None` means half the server-granted
    /// lifetime; a zero duration disables refreshes.
    pub refresh_rate: Option<Duration>,
    pub refresh_disabled: bool,
    /// The transport shared by every conversation with the server.
    pub conn: Option<Arc<dyn Conn + Send + Sync>>,
    /// Overrides the built-in STUN transactor; mostly useful in tests.
    pub transactor: Option<Arc<dyn Transactor + Send + Sync>>,
}

pub(crate) struct ClientInternal {
    conn: Option<Arc<dyn Conn + Send + Sync>>,
    transactor: Option<Arc<dyn Transactor + Send + Sync>>,
    stun_serv_addr: Option<SocketAddr>,
    turn_serv_addr: Option<SocketAddr>,
    auth: Arc<Mutex<AuthState>>,
    software: Option<Software>,
    tr_map: Arc<Mutex<TransactionMap>>,
    perm_map: Arc<Mutex<PermissionMap>>,
    binding_mgr: Arc<Mutex<BindingManager>>,
    rto_in_ms: u16,
    no_retransmit: bool,
    refresh_rate: Option<Duration>,
    refresh_disabled: bool,
    alloc_token: Mutex<Option<CancellationToken>>,
    lost: AtomicBool,
    close_notify: CancellationToken,
}

#[async_trait]
impl Transactor for ClientInternal {
    /// Performs a STUN transaction against the TURN server.
    async fn perform(&self, msg: &Message, dont_wait: bool) -> Result<TransactionResult> {
        if self.close_notify.is_cancelled() {
            return Err(Error::ErrCanceled);
        }
        if let Some(transactor) = &self.transactor {
            return transactor.perform(msg, dont_wait).await;
        }
        let to = self.turn_serv_addr.ok_or(Error::ErrTurnServerAddressNotSet)?;
        self.perform_to(msg, to, dont_wait).await
    }

    /// Writes an already-encoded frame to the TURN server.
    async fn indicate(&self, data: &[u8]) -> Result<usize> {
        if let Some(transactor) = &self.transactor {
            return transactor.indicate(data).await;
        }
        let conn = self.conn.as_ref().ok_or(Error::ErrNoTransport)?;
        let to = self.turn_serv_addr.ok_or(Error::ErrTurnServerAddressNotSet)?;
        Ok(conn.send_to(data, to).await?)
    }
}

impl ClientInternal {
    /// Creates a new [`ClientInternal`].
    async fn new(config: ClientConfig) -> Result<Self> {
        if config.conn.is_none() && config.transactor.is_none() {
            return Err(Error::ErrNoTransport);
        }

        let (stun_serv_addr, turn_serv_addr) = if let Some(conn) = &config.conn {
            let ipv4 = conn.local_addr()?.is_ipv4();

            let stun_serv_addr = if config.stun_serv_addr.is_empty() {
                None
            } else {
                log::debug!("resolving {}", config.stun_serv_addr);
                Some(resolve_addr(ipv4, &config.stun_serv_addr).await?)
            };
            let turn_serv_addr = if config.turn_serv_addr.is_empty() {
                None
            } else {
                log::debug!("resolving {}", config.turn_serv_addr);
                Some(resolve_addr(ipv4, &config.turn_serv_addr).await?)
            };

            (stun_serv_addr, turn_serv_addr)
        } else {
            (None, None)
        };

        Ok(ClientInternal {
            conn: config.conn,
            transactor: config.transactor,
            stun_serv_addr,
            turn_serv_addr,
            auth: Arc::new(Mutex::new(AuthState::new(
                config.username,
                config.password,
                config.realm,
            ))),
            software: if config.software.is_empty() {
                None
            } else {
                Some(Software::new(ATTR_SOFTWARE, config.software))
            },
            tr_map: Arc::new(Mutex::new(TransactionMap::new())),
            perm_map: Arc::new(Mutex::new(PermissionMap::new())),
            binding_mgr: Arc::new(Mutex::new(BindingManager::new())),
            rto_in_ms: if config.rto_in_ms != 0 {
                config.rto_in_ms
            } else {
                DEFAULT_RTO_IN_MS
            },
            no_retransmit: config.no_retransmit,
            refresh_rate: config.refresh_rate,
            refresh_disabled: config.refresh_disabled,
            alloc_token: Mutex::new(None),
            lost: AtomicBool::new(false),
            close_notify: CancellationToken::new(),
        })
    }

    /// Registers `msg` in the pending map and writes it to `to`,
    /// arming the retransmission timer.
    async fn perform_to(
        &self,
        msg: &Message,
        to: SocketAddr,
        dont_wait: bool,
    ) -> Result<TransactionResult> {
        let conn = self.conn.as_ref().ok_or(Error::ErrNoTransport)?;
        let id = msg.transaction_id;

        let mut tr = Transaction::new(TransactionConfig {
            id,
            raw: msg.raw.clone(),
            to,
            interval: self.rto_in_ms,
            ignore_result: dont_wait,
            no_retransmit: self.no_retransmit,
        });
        let result_ch_rx = tr.get_result_channel();

        log::trace!(
            "start {} transaction {} to {}",
            msg.typ,
            BASE64_STANDARD.encode(id.0),
            to
        );
        {
            let mut tm = self.tr_map.lock().await;
            tm.insert(tr);
        }

        if let Err(err) = conn.send_to(&msg.raw, to).await {
            let mut tm = self.tr_map.lock().await;
            if let Some(mut tr) = tm.delete(&id) {
                tr.close();
            }
            return Err(Error::Util(err));
        }

        let conn2 = Arc::clone(conn);
        let tr_map2 = Arc::clone(&self.tr_map);
        {
            let mut tm = self.tr_map.lock().await;
            if let Some(tr) = tm.get(&id) {
                tr.start_rtx_timer(conn2, tr_map2).await;
            }
        }

        // With dont_wait, get the transaction going and return
        // immediately.
        if dont_wait {
            return Ok(TransactionResult::default());
        }

        let mut result_ch_rx =
            result_ch_rx.ok_or(Error::ErrWaitForResultOnNonResultTransaction)?;
        match result_ch_rx.recv().await {
            Some(tr_res) => {
                if let Some(err) = tr_res.err {
                    return Err(err);
                }
                Ok(tr_res)
            }
            None => Err(Error::ErrTransactionClosed),
        }
    }

    /// `listen()` will have this client start reading the `conn`
    /// provided via the config. This is optional; without it, incoming
    /// data must be supplied through `handle_inbound`.
    fn listen(self: Arc<Self>) -> Result<()> {
        let conn = self
            .conn
            .as_ref()
            .map(Arc::clone)
            .ok_or(Error::ErrNoTransport)?;
        let ci = self;

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATA_BUFFER_SIZE];
            let wait_cancel = ci.close_notify.cancelled();
            pin!(wait_cancel);

            loop {
                let (n, from) = select! {
                    biased;

                    _ = &mut wait_cancel => {
                        log::debug!("exiting read loop");
                        break;
                    },
                    result = conn.recv_from(&mut buf) => match result {
                        Ok((n, from)) => (n, from),
                        Err(err) => {
                            log::debug!("exiting read loop: {err}");
                            ci.connection_lost().await;
                            break;
                        }
                    }
                };
                log::trace!("received {n} bytes from {from}");

                // Inbound parse failures never propagate; the frame is
                // logged and dropped.
                if let Err(err) = ci.handle_inbound(&buf[..n], from).await {
                    log::debug!("discarded inbound frame from {from}: {err}");
                }
            }
        });

        Ok(())
    }

    /// Demultiplexes one inbound frame by its leading two bits: `00` is
    /// a STUN message, `01` a ChannelData frame; everything else is
    /// dropped.
    async fn handle_inbound(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        if is_message(data) {
            self.handle_stun_message(data, from).await
        } else if ChannelData::is_channel_data(data) {
            self.handle_channel_data(data).await
        } else {
            log::trace!("non-STUN/TURN packet from {from}, dropped");
            Ok(())
        }
    }

    async fn handle_stun_message(&self, data: &[u8], mut from: SocketAddr) -> Result<()> {
        let mut msg = Message::new();
        msg.raw = data.to_vec();
        msg.decode()?;

        if msg.typ.class == CLASS_REQUEST {
            return Err(Error::ErrUnexpectedStunRequest);
        }

        if msg.typ.class == CLASS_INDICATION {
            if msg.typ.method == METHOD_DATA {
                let mut peer_addr = PeerAddress::default();
                peer_addr.get_from(&msg)?;
                from = SocketAddr::new(peer_addr.ip, peer_addr.port);

                let mut data = Data::default();
                data.get_from(&msg)?;

                log::debug!("data indication received from {from}");

                let inner = {
                    let perm_map = self.perm_map.lock().await;
                    perm_map.find(&from).map(Arc::clone)
                };
                match inner {
                    Some(inner) => inner.enqueue(&data.0).await,
                    None => log::debug!("no permission for data from {from}, dropped"),
                }
            } else {
                log::debug!("{} indication dropped", msg.typ);
            }

            return Ok(());
        }

        // This is a response message (success or error), matched to its
        // pending transaction by id. Unmatched responses are dropped.
        let id = msg.transaction_id;

        let mut tm = self.tr_map.lock().await;
        if let Some(mut tr) = tm.delete(&id) {
            tr.stop_rtx_timer();
            let retries = tr.retries();
            drop(tm);

            if !tr
                .write_result(TransactionResult {
                    msg,
                    from,
                    retries,
                    err: None,
                })
                .await
            {
                log::debug!("no listener for transaction {}", BASE64_STANDARD.encode(id.0));
            }
        } else {
            log::debug!("no transaction for {msg}");
        }

        Ok(())
    }

    async fn handle_channel_data(&self, data: &[u8]) -> Result<()> {
        let mut ch_data = ChannelData {
            raw: data.to_vec(),
            ..Default::default()
        };
        ch_data.decode()?;

        let addr = {
            let binding_mgr = self.binding_mgr.lock().await;
            binding_mgr
                .find_by_number(ch_data.number.0)
                .map(|b| b.addr)
                .ok_or(Error::ErrChannelBindNotFound)?
        };

        log::trace!(
            "channel data received from {} (ch={})",
            addr,
            ch_data.number.0
        );

        let inner = {
            let perm_map = self.perm_map.lock().await;
            perm_map.find(&addr).map(Arc::clone)
        };
        match inner {
            Some(inner) => inner.enqueue(&ch_data.data).await,
            None => log::debug!("no permission for channel data from {addr}, dropped"),
        }

        Ok(())
    }

    /// Called by the read loop when the transport dies: every pending
    /// transaction and permission fails with `ErrConnectionLost` and
    /// the client goes dead.
    async fn connection_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
        {
            let mut perm_map = self.perm_map.lock().await;
            perm_map.close_all(true);
        }
        {
            let mut tm = self.tr_map.lock().await;
            tm.fail_all(|| Error::ErrConnectionLost).await;
        }
        self.close_notify.cancel();
    }

    /// Closes this client.
    async fn close(&self) {
        self.close_notify.cancel();
        {
            let mut perm_map = self.perm_map.lock().await;
            perm_map.close_all(false);
        }
        {
            let mut binding_mgr = self.binding_mgr.lock().await;
            binding_mgr.clear();
        }
        {
            let mut tm = self.tr_map.lock().await;
            tm.fail_all(|| Error::ErrCanceled).await;
        }
    }

    fn build_allocate_request(&self, auth_state: Option<&AuthState>) -> Result<Message> {
        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST)),
            Box::new(RequestedTransport {
                protocol: PROTO_UDP,
            }),
        ];
        if let Some(software) = &self.software {
            setters.push(Box::new(software.clone()));
        }
        if let Some(auth_state) = auth_state {
            auth_state.sign(&mut setters);
        }
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        msg.build(&setters)?;
        Ok(msg)
    }

    /// Obtains a relay lease from the TURN server.
    async fn allocate(&self) -> Result<AllocationConfig> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(Error::ErrConnectionLost);
        }
        if self.close_notify.is_cancelled() {
            return Err(Error::ErrCanceled);
        }

        // Reserve the one-allocation slot before going to the wire.
        {
            let mut alloc_token = self.alloc_token.lock().await;
            if let Some(token) = &*alloc_token {
                if !token.is_cancelled() {
                    return Err(Error::ErrOneAllocateOnly);
                }
            }
            *alloc_token = Some(self.close_notify.child_token());
        }

        let result = self.do_allocate().await;
        if result.is_err() {
            let mut alloc_token = self.alloc_token.lock().await;
            *alloc_token = None;
        }
        result
    }

    async fn do_allocate(&self) -> Result<AllocationConfig> {
        let msg = self.build_allocate_request(None)?;
        log::debug!("client.Allocate call perform 1");
        let tr_res = self.perform(&msg, false).await?;
        let mut res = tr_res.msg;

        if res.typ.class == CLASS_ERROR_RESPONSE {
            let mut code = ErrorCodeAttribute::default();
            if code.get_from(&res).is_err() {
                return Err(Error::Other(format!("{}", res.typ)));
            }
            if code.code != CODE_UNAUTHORIZED && code.code != CODE_STALE_NONCE {
                return Err(server_error(&code));
            }

            // The server challenged us: absorb REALM and NONCE, derive
            // the long-term key and reissue once with a fresh
            // transaction id. A second challenge is fatal.
            {
                let mut auth_state = self.auth.lock().await;
                auth_state.absorb_challenge(&res)?;
            }
            let msg = {
                let auth_state = self.auth.lock().await;
                self.build_allocate_request(Some(&auth_state))?
            };
            log::debug!("client.Allocate call perform 2");
            let tr_res = self.perform(&msg, false).await?;
            res = tr_res.msg;

            if res.typ.class == CLASS_ERROR_RESPONSE {
                let mut code = ErrorCodeAttribute::default();
                if code.get_from(&res).is_err() {
                    return Err(Error::Other(format!("{}", res.typ)));
                }
                return Err(server_error(&code));
            }

            let auth_state = self.auth.lock().await;
            auth_state.verify(&mut res)?;
        }

        if res.typ.method != METHOD_ALLOCATE {
            return Err(Error::ErrUnexpectedResponse);
        }

        // RELAYED-ADDRESS is mandatory in a success response.
        let mut relayed = RelayedAddress::default();
        relayed
            .get_from(&res)
            .map_err(|_| Error::ErrMalformedResponse)?;
        let relayed_addr = SocketAddr::new(relayed.ip, relayed.port);

        // XOR-MAPPED-ADDRESS is optional.
        let mut refl = XorMappedAddress::default();
        let reflexive_addr = if refl.get_from(&res).is_ok() {
            Some(SocketAddr::new(refl.ip, refl.port))
        } else {
            None
        };

        let mut lifetime = Lifetime::default();
        let lifetime = if lifetime.get_from(&res).is_ok() {
            lifetime.0
        } else {
            DEFAULT_LIFETIME
        };

        let close_notify = {
            let alloc_token = self.alloc_token.lock().await;
            match &*alloc_token {
                Some(token) => token.clone(),
                None => return Err(Error::ErrCanceled),
            }
        };

        let refresh_interval = if self.refresh_disabled {
            None
        } else {
            match self.refresh_rate {
                Some(d) if d.is_zero() => None,
                Some(d) => Some(d),
                None => Some(lifetime / 2),
            }
        };

        Ok(AllocationConfig {
            relayed_addr,
            reflexive_addr,
            lifetime,
            auth: Arc::clone(&self.auth),
            software: self.software.clone(),
            perm_map: Arc::clone(&self.perm_map),
            binding_mgr: Arc::clone(&self.binding_mgr),
            refresh_interval,
            close_notify,
        })
    }

    /// Sends a STUN Binding request to the given transport address and
    /// returns the reflexive address from the answer.
    async fn send_binding_request_to(&self, to: SocketAddr) -> Result<SocketAddr> {
        let msg = {
            let mut setters: Vec<Box<dyn Setter>> = vec![
                Box::new(TransactionId::new()),
                Box::new(BINDING_REQUEST),
            ];
            if let Some(software) = &self.software {
                setters.push(Box::new(software.clone()));
            }
            setters.push(Box::new(FINGERPRINT));

            let mut msg = Message::new();
            msg.build(&setters)?;
            msg
        };

        let tr_res = if let Some(transactor) = &self.transactor {
            transactor.perform(&msg, false).await?
        } else {
            self.perform_to(&msg, to, false).await?
        };

        let mut refl_addr = XorMappedAddress::default();
        refl_addr.get_from(&tr_res.msg)?;

        Ok(SocketAddr::new(refl_addr.ip, refl_addr.port))
    }
}

/// `Client` is a TURN client over one shared transport: it multiplexes
/// STUN transactions, indications and ChannelData frames outbound, and
/// demultiplexes the inbound stream back to pending transactions and
/// permission conduits.
#[derive(Clone)]
pub struct Client {
    client_internal: Arc<ClientInternal>,
}

impl Client {
    /// Creates a new [`Client`]. Fails with `ErrNoTransport` unless a
    /// transport conn or an injected transactor is supplied.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let ci = ClientInternal::new(config).await?;
        Ok(Client {
            client_internal: Arc::new(ci),
        })
    }

    /// Starts the demultiplexer on the configured transport.
    pub fn listen(&self) -> Result<()> {
        Arc::clone(&self.client_internal).listen()
    }

    /// Feeds one raw inbound frame to the demultiplexer. Only needed
    /// when the transport is driven externally instead of via
    /// [`Client::listen`].
    pub async fn handle_inbound(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        self.client_internal.handle_inbound(data, from).await
    }

    /// Obtains a relay lease and returns the [`Allocation`] managing
    /// it. At most one live allocation is allowed per client.
    pub async fn allocate(&self) -> Result<Allocation> {
        let config = self.client_internal.allocate().await?;

        let obs: Arc<dyn Transactor + Send + Sync> =
            Arc::clone(&self.client_internal) as Arc<dyn Transactor + Send + Sync>;
        Ok(Allocation::new(obs, config).await)
    }

    /// Closes this client: cancels every pending transaction and timer
    /// and closes all permissions. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.client_internal.close().await;
        Ok(())
    }

    /// Sends a STUN Binding request to the given transport address.
    pub async fn send_binding_request_to(&self, to: &str) -> Result<SocketAddr> {
        let to = SocketAddr::from_str(to)?;
        self.client_internal.send_binding_request_to(to).await
    }

    /// Sends a STUN Binding request to the configured STUN server.
    pub async fn send_binding_request(&self) -> Result<SocketAddr> {
        let to = self
            .client_internal
            .stun_serv_addr
            .ok_or(Error::ErrStunServerAddressNotSet)?;
        self.client_internal.send_binding_request_to(to).await
    }
}

fn server_error(code: &ErrorCodeAttribute) -> Error {
    Error::ErrServer {
        code: code.code.0,
        reason: String::from_utf8_lossy(&code.reason).to_string(),
    }
}

async fn resolve_addr(ipv4: bool, addr: &str) -> Result<SocketAddr> {
    let mut fallback = None;
    for candidate in tokio::net::lookup_host(addr).await? {
        if candidate.is_ipv4() == ipv4 {
            return Ok(candidate);
        }
        fallback = Some(candidate);
    }
    fallback.ok_or_else(|| Error::Other(format!("unable to resolve {addr}")))
}
