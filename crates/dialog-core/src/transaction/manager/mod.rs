//! # Transaction manager
//!
//! Owns the live client and server transactions of one SIP endpoint, the
//! response cache, and the per Call-ID list of dialog owners ("consumers").
//!
//! ## Incoming datagrams
//!
//! 1. The raw bytes are hashed. A cache hit is answered from the cache (or
//!    dropped) without parsing.
//! 2. Responses are matched by CSeq method and branch. Unmatched responses
//!    carrying more than one Via are passed on unchanged to their top Via,
//!    anything else is dropped.
//! 3. Requests matching one of our own client transactions through any of
//!    their Vias are loops and get 482. ACKs are matched by To tag, CANCELs
//!    against their INVITE, other requests by method and branch. A stray ACK
//!    is dropped, a stray CANCEL gets 481.
//! 4. A new server transaction goes to the consumer that claims it, or to the
//!    [`CallMap`] when none does.
//!
//! The transaction maps have their own short-lived locks; transaction logic
//! always runs under the transaction's session lock, never under a map lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use b2bua_infra_common::{SessionLock, Timeout};
use b2bua_sip_core::{
    salvage_error_response, HeaderAccess, HeaderName, HostPort, Message, Method, Request, Response,
    SipHeader, Via, DEFAULT_MAX_FORWARDS,
};
use b2bua_sip_transport::{
    Datagram, DatagramHandler, LocalBinding, LocalForRemote, Transport, UdpServer, UdpServerConfig,
    UdpServerFactory, DEFAULT_ROTATE_INTERVAL,
};
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::TransactionConfig;
use crate::errors::{DialogError, DialogResult};
use crate::transaction::cache::{checksum, CacheEntry, Checksum, ResponseCache};
use crate::transaction::client::ClientTransaction;
use crate::transaction::key::{KeyFields, TransactionKey};
use crate::transaction::server::ServerTransaction;
use crate::transaction::traits::{CallMap, NewDialog, RequestReceiver, ResponseReceiver};

/// How to run a new client transaction
#[derive(Clone)]
pub struct ClientTransactionOptions {
    pub resp_receiver: Option<Weak<dyn ResponseReceiver>>,
    /// Lock the transaction's timers and response handling run under
    pub session_lock: SessionLock,
    /// Next hop; derived from the request when absent
    pub target: Option<HostPort>,
    /// Transport to send from; picked per destination when absent
    pub transport: Option<Arc<dyn Transport>>,
    /// Address for the Via sent-by when `transport` is given
    pub laddress: Option<HostPort>,
    pub outbound_proxy: Option<HostPort>,
    /// Hold the 2xx ACK until [`ClientTransaction::send_ack`]
    pub uack: bool,
}

impl ClientTransactionOptions {
    pub fn new(session_lock: SessionLock) -> Self {
        ClientTransactionOptions {
            resp_receiver: None,
            session_lock,
            target: None,
            transport: None,
            laddress: None,
            outbound_proxy: None,
            uack: false,
        }
    }

    pub fn with_receiver(mut self, receiver: Weak<dyn ResponseReceiver>) -> Self {
        self.resp_receiver = Some(receiver);
        self
    }

    pub fn with_target(mut self, target: HostPort) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_binding(mut self, binding: LocalBinding) -> Self {
        self.transport = Some(binding.transport);
        self.laddress = Some(binding.laddress);
        self
    }

    pub fn with_outbound_proxy(mut self, proxy: Option<HostPort>) -> Self {
        self.outbound_proxy = proxy;
        self
    }

    pub fn with_uack(mut self, uack: bool) -> Self {
        self.uack = uack;
        self
    }
}

/// Transaction layer of one SIP endpoint
pub struct TransactionManager {
    me: Weak<TransactionManager>,
    config: TransactionConfig,
    call_map: Arc<dyn CallMap>,
    lfr: OnceCell<Arc<LocalForRemote>>,
    client_transactions: Mutex<HashMap<TransactionKey, Arc<ClientTransaction>>>,
    server_transactions: Mutex<HashMap<TransactionKey, Arc<ServerTransaction>>>,
    consumers: DashMap<String, Vec<Arc<dyn RequestReceiver>>>,
    cache: Mutex<ResponseCache>,
    rotator: Mutex<Option<Timeout>>,
    shut_down: AtomicBool,
}

impl TransactionManager {
    /// Create a manager. Must be called inside a tokio runtime; no transport
    /// is attached yet (see [`TransactionManager::attach`] and
    /// [`TransactionManager::start_udp`]).
    pub fn new(config: TransactionConfig, call_map: Arc<dyn CallMap>) -> Arc<Self> {
        let rotate_interval = config.cache_rotate_interval;
        let tm = Arc::new_cyclic(|me| TransactionManager {
            me: me.clone(),
            config,
            call_map,
            lfr: OnceCell::new(),
            client_transactions: Mutex::new(HashMap::new()),
            server_transactions: Mutex::new(HashMap::new()),
            consumers: DashMap::new(),
            cache: Mutex::new(ResponseCache::new()),
            rotator: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });
        let weak = tm.me.clone();
        let rotator = Timeout::start_new(
            move || {
                if let Some(tm) = weak.upgrade() {
                    tm.cache.lock().rotate();
                }
            },
            None,
            rotate_interval,
            -1,
        );
        *tm.rotator.lock() = Some(rotator);
        tm
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Attach the local address selector outgoing traffic uses
    pub fn attach(&self, lfr: Arc<LocalForRemote>) -> DialogResult<()> {
        self.lfr
            .set(lfr)
            .map_err(|_| DialogError::invalid_state("transport already attached"))
    }

    /// Callback feeding received datagrams into this manager
    pub fn datagram_handler(&self) -> DatagramHandler {
        let weak = self.me.clone();
        Arc::new(move |dgram: Datagram| {
            if let Some(tm) = weak.upgrade() {
                tm.handle_incoming(dgram);
            }
        })
    }

    /// Bind a UDP server and attach it, fixed or with per-destination local
    /// address selection depending on `config.fixed`
    pub fn start_udp(&self, config: UdpServerConfig) -> DialogResult<Arc<UdpServer>> {
        let handler = self.datagram_handler();
        let server = UdpServer::bind(config.clone(), handler.clone())?;
        let lfr = if config.fixed {
            LocalForRemote::fixed(server.clone())
        } else {
            LocalForRemote::new(
                server.clone(),
                Arc::new(UdpServerFactory::new(config, handler)),
                DEFAULT_ROTATE_INTERVAL,
            )
        };
        self.attach(lfr)?;
        Ok(server)
    }

    /// Local transport and address to use towards `remote`
    pub fn binding_for(&self, remote: &HostPort) -> DialogResult<LocalBinding> {
        let lfr = self
            .lfr
            .get()
            .ok_or_else(|| DialogError::invalid_state("no transport attached"))?;
        Ok(lfr.binding_for(remote))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Start a client transaction for `req`.
    ///
    /// A Via with a fresh branch is added when the request has none. The next
    /// hop is, in order: `options.target`, the outbound proxy, the first
    /// Route, the Request-URI.
    pub fn new_client_transaction(
        &self,
        mut req: Request,
        options: ClientTransactionOptions,
    ) -> DialogResult<Arc<ClientTransaction>> {
        if self.is_shut_down() {
            return Err(DialogError::ShutDown);
        }
        let tm = self.me.upgrade().ok_or(DialogError::ShutDown)?;
        let target = match (&options.target, &options.outbound_proxy) {
            (Some(target), _) => target.clone(),
            (None, Some(proxy)) => proxy.clone(),
            (None, None) => match req.routes().first() {
                Some(route) if route.uri.lr() => route.uri.host_port(),
                _ => req.uri.host_port(),
            },
        };
        let binding = match &options.transport {
            Some(transport) => LocalBinding {
                transport: transport.clone(),
                laddress: options.laddress.clone().unwrap_or_else(|| transport.local_addr()),
            },
            None => self.binding_for(&target)?,
        };
        if !req.has_header(&HeaderName::Via) {
            req.headers_mut()
                .insert(0, SipHeader::Via(Via::new_udp(&binding.laddress)));
        }
        if req.max_forwards().is_none() {
            req.append_header(SipHeader::MaxForwards(DEFAULT_MAX_FORWARDS));
        }
        let tid = TransactionKey::from_message(&req, KeyFields::METHOD_BRANCH)?;

        let tx = ClientTransaction::new(&tm, tid.clone(), req, target, binding.transport, &options);
        {
            let mut map = self.client_transactions.lock();
            if map.contains_key(&tid) {
                return Err(DialogError::transaction_exists(&tid));
            }
            map.insert(tid.clone(), tx.clone());
        }
        debug!(tid = %tid, destination = %tx.destination(), "client transaction started");
        tx.start();
        Ok(tx)
    }

    /// Send `resp` through the server transaction it answers
    pub fn send_response(&self, resp: Response, retransmit: bool) -> DialogResult<()> {
        let tid = TransactionKey::from_message(&resp, KeyFields::METHOD_BRANCH)?;
        let tx = self.server_transactions.lock().get(&tid).cloned();
        match tx {
            Some(tx) => tx.send_response(resp, retransmit),
            None => {
                warn!(tid = %tid, "response {} for unknown transaction", resp.scode);
                Err(DialogError::no_transaction(&tid))
            }
        }
    }

    /// Every outgoing datagram passes here. With `cachesum` the data is also
    /// remembered as the answer to the request with that checksum; while
    /// `lossemul` is non-zero the send is skipped to emulate loss.
    pub fn transmit_data(
        &self,
        transport: &Arc<dyn Transport>,
        data: Bytes,
        destination: &HostPort,
        cachesum: Option<Checksum>,
        call_id: &str,
        lossemul: u32,
    ) {
        if let Some(sum) = cachesum {
            self.cache_insert(
                sum,
                CacheEntry {
                    transport: transport.clone(),
                    data: Some(data.clone()),
                    destination: destination.clone(),
                    call_id: call_id.to_string(),
                    lossemul: lossemul.saturating_sub(1),
                },
            );
            if lossemul > 0 {
                debug!(call_id, %destination, "emulating loss, {} more to drop", lossemul - 1);
                return;
            }
        }
        trace!(call_id, %destination, len = data.len(), "sending");
        if let Err(e) = transport.send_to(data, destination) {
            warn!(call_id, %destination, "send failed: {}", e);
        }
    }

    pub fn cache_insert(&self, sum: Checksum, entry: CacheEntry) {
        self.cache.lock().insert(sum, entry);
    }

    /// Register `consumer` as owner of in-dialog requests for `call_id`
    pub fn reg_consumer(&self, consumer: Arc<dyn RequestReceiver>, call_id: &str) {
        self.consumers
            .entry(call_id.to_string())
            .or_default()
            .push(consumer);
    }

    pub fn unreg_consumer(&self, consumer: &Arc<dyn RequestReceiver>, call_id: &str) {
        let now_empty = match self.consumers.get_mut(call_id) {
            Some(mut list) => {
                list.retain(|c| !same_receiver(c, consumer));
                list.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.consumers.remove_if(call_id, |_, list| list.is_empty());
        }
    }

    pub fn consumer_count(&self, call_id: &str) -> usize {
        self.consumers.get(call_id).map(|l| l.len()).unwrap_or(0)
    }

    pub fn client_count(&self) -> usize {
        self.client_transactions.lock().len()
    }

    pub fn server_count(&self) -> usize {
        self.server_transactions.lock().len()
    }

    pub(crate) fn remove_client(&self, tid: &TransactionKey) {
        self.client_transactions.lock().remove(tid);
    }

    pub(crate) fn remove_server(&self, tid: &TransactionKey) {
        self.server_transactions.lock().remove(tid);
    }

    /// Move a server transaction to its post-final-response key
    pub(crate) fn rekey_server(&self, old: &TransactionKey, new: TransactionKey, tx: Arc<ServerTransaction>) {
        let mut map = self.server_transactions.lock();
        map.remove(old);
        map.insert(new, tx);
    }

    /// Entry point for received datagrams
    pub fn handle_incoming(&self, dgram: Datagram) {
        if self.is_shut_down() {
            return;
        }
        let sum = checksum(&dgram.data);
        if self.replay_from_cache(&sum) {
            return;
        }
        if Message::is_response_data(&dgram.data) {
            match Response::parse(&dgram.data) {
                Ok(mut resp) => {
                    resp.source = Some(dgram.source.clone());
                    resp.rtime = Some(dgram.rtime);
                    self.incoming_response(resp, &dgram, sum);
                }
                Err(e) => debug!(source = %dgram.source, "dropping unparseable response: {}", e),
            }
            return;
        }
        match Request::parse(&dgram.data) {
            Ok(mut req) => {
                req.source = Some(dgram.source.clone());
                req.rtime = Some(dgram.rtime);
                self.incoming_request(req, &dgram, sum);
            }
            Err(e) => {
                debug!(source = %dgram.source, "unparseable request: {}", e);
                let reason = format!("Bad Request - {}", e);
                if let Some(resp) = salvage_error_response(&dgram.data, 400, &reason) {
                    self.transmit_data(&dgram.transport, resp.to_bytes(), &dgram.source, Some(sum), "", 0);
                }
            }
        }
    }

    /// `true` when the cache dealt with the datagram
    fn replay_from_cache(&self, sum: &Checksum) -> bool {
        let replay = {
            let mut cache = self.cache.lock();
            let Some(entry) = cache.get_mut(sum) else {
                return false;
            };
            match &entry.data {
                None => None,
                Some(_) if entry.lossemul > 0 => {
                    entry.lossemul -= 1;
                    None
                }
                Some(data) => Some((entry.transport.clone(), data.clone(), entry.destination.clone())),
            }
        };
        match replay {
            Some((transport, data, destination)) => {
                debug!(%destination, "duplicate request, replaying cached response");
                if let Err(e) = transport.send_to(data, &destination) {
                    warn!(%destination, "cannot replay cached response: {}", e);
                }
            }
            None => trace!("duplicate datagram dropped"),
        }
        true
    }

    fn incoming_response(&self, resp: Response, dgram: &Datagram, sum: Checksum) {
        let tid = match TransactionKey::from_message(&resp, KeyFields::METHOD_BRANCH) {
            Ok(tid) => tid,
            Err(e) => {
                debug!(source = %dgram.source, "response without transaction identity: {}", e);
                return;
            }
        };
        let tx = self.client_transactions.lock().get(&tid).cloned();
        if let Some(tx) = tx {
            let lock = tx.session_lock().clone();
            let _guard = lock.lock();
            tx.incoming_response(resp);
            return;
        }

        // Stray response relayed by someone: it reached the wrong local port,
        // pass it on unchanged to the one its top Via names
        let vias = resp.vias();
        if vias.len() < 2 {
            debug!(tid = %tid, "stray response {} dropped", resp.scode);
            return;
        }
        let owner = vias[0].response_target();
        debug!(tid = %tid, destination = %owner, "forwarding stray response");
        self.transmit_data(&dgram.transport, dgram.data.clone(), &owner, None, &tid.call_id, 0);
        self.cache_insert(sum, CacheEntry::suppress(dgram.transport.clone(), owner, &tid.call_id));
    }

    fn incoming_request(&self, mut req: Request, dgram: &Datagram, sum: Checksum) {
        if let Ok(via) = req.top_via_mut() {
            via.fix_received(&dgram.source);
        }
        let response_target = req
            .top_via()
            .map(Via::response_target)
            .unwrap_or_else(|_| dgram.source.clone());
        let key = match TransactionKey::from_message(&req, KeyFields::METHOD_BRANCH) {
            Ok(key) => key,
            Err(e) => {
                debug!(source = %dgram.source, "request without transaction identity: {}", e);
                return;
            }
        };
        let call_id = key.call_id.clone();

        let looped = {
            let clients = self.client_transactions.lock();
            key.via_candidates(&req).iter().any(|k| clients.contains_key(k))
        };
        if looped {
            info!(tid = %key, "request matches one of our own transactions, loop detected");
            let resp = req.gen_response(482, "Loop Detected");
            self.transmit_data(&dgram.transport, resp.to_bytes(), &response_target, Some(sum), &call_id, 0);
            return;
        }

        match req.method {
            Method::Ack => {
                let ack_key = match TransactionKey::from_message(&req, KeyFields::TO_TAG) {
                    Ok(k) => k,
                    Err(_) => return,
                };
                let tx = self.server_transactions.lock().get(&ack_key).cloned();
                match tx {
                    Some(tx) => {
                        let lock = tx.session_lock();
                        let _guard = lock.lock();
                        tx.incoming_ack(req, sum);
                    }
                    None => {
                        debug!(tid = %ack_key, "stray ACK dropped");
                        self.cache_insert(
                            sum,
                            CacheEntry::suppress(dgram.transport.clone(), response_target, &call_id),
                        );
                    }
                }
            }
            Method::Cancel => {
                let invite_key = key.with_method(Method::Invite);
                let tx = self.server_transactions.lock().get(&invite_key).cloned();
                match tx {
                    Some(tx) => {
                        let lock = tx.session_lock();
                        let _guard = lock.lock();
                        tx.incoming_cancel(req, sum);
                    }
                    None => {
                        debug!(tid = %invite_key, "CANCEL for unknown transaction");
                        let resp = req.gen_response(481, "Call Leg/Transaction Does Not Exist");
                        self.transmit_data(
                            &dgram.transport,
                            resp.to_bytes(),
                            &response_target,
                            Some(sum),
                            &call_id,
                            0,
                        );
                    }
                }
            }
            _ => {
                let tx = self.server_transactions.lock().get(&key).cloned();
                match tx {
                    Some(tx) => {
                        let lock = tx.session_lock();
                        let _guard = lock.lock();
                        tx.incoming_duplicate();
                    }
                    None => self.new_server_transaction(req, key, call_id, dgram, sum, response_target),
                }
            }
        }
    }

    fn new_server_transaction(
        &self,
        req: Request,
        key: TransactionKey,
        call_id: String,
        dgram: &Datagram,
        sum: Checksum,
        response_target: HostPort,
    ) {
        let Some(tm) = self.me.upgrade() else {
            return;
        };
        let tx = ServerTransaction::new(
            &tm,
            key.clone(),
            req.clone(),
            sum,
            dgram.transport.clone(),
            response_target.clone(),
        );
        self.server_transactions.lock().insert(key.clone(), tx.clone());
        // Nothing to answer duplicates with until the first response
        self.cache_insert(
            sum,
            CacheEntry::suppress(dgram.transport.clone(), response_target, &call_id),
        );
        trace!(tid = %key, "server transaction created");

        let private = tx.session_lock();
        let private_guard = private.lock();
        let consumers: Vec<Arc<dyn RequestReceiver>> = self
            .consumers
            .get(&call_id)
            .map(|list| list.value().clone())
            .unwrap_or_default();
        let receiver = match consumers.into_iter().find(|c| c.is_yours(&req)) {
            Some(consumer) => Some(consumer),
            None => match self.call_map.on_new_dialog(&tm, &req, &tx) {
                NewDialog::Accept(receiver) => Some(receiver),
                NewDialog::Reject(resp) => {
                    if let Err(e) = tx.send_response(resp, false) {
                        warn!(tid = %key, "cannot send rejection: {}", e);
                    }
                    None
                }
                NewDialog::Ignore => {
                    tx.cleanup();
                    None
                }
            },
        };
        let Some(receiver) = receiver else {
            return;
        };
        let ua_lock = receiver.session_lock();
        let _ua_guard = ua_lock.lock();
        tx.upgrade_lock(ua_lock.clone());
        drop(private_guard);
        receiver.recv_request(req, &tx);
    }

    /// Stop all transactions and release the transports
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(rotator) = self.rotator.lock().take() {
            rotator.cancel();
        }
        let clients: Vec<_> = self.client_transactions.lock().drain().map(|(_, tx)| tx).collect();
        for tx in clients {
            tx.cleanup();
        }
        let servers: Vec<_> = self.server_transactions.lock().drain().map(|(_, tx)| tx).collect();
        for tx in servers {
            tx.cleanup();
        }
        self.consumers.clear();
        self.cache.lock().clear();
        if let Some(lfr) = self.lfr.get() {
            lfr.shutdown();
        }
        info!("transaction manager shut down");
    }
}

fn same_receiver(a: &Arc<dyn RequestReceiver>, b: &Arc<dyn RequestReceiver>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("clients", &self.client_count())
            .field("servers", &self.server_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
