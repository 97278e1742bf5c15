//! UDP driver: vockets over datagrams with the NOM-1 peering protocol.
//!
//! One reactor thread per registered driver. The loop multiplexes:
//! - the control mailbox (bind/connect/close/getmeta/shutdown)
//! - each vocket's app mailbox, while enough peerings are live
//! - each vocket's UDP handle
//!
//! Every vocket owns at most one UDP handle. `bind` places it on the
//! caller's address; `connect` without a prior bind leaves the source port
//! ephemeral. Outgoing traffic always originates from that handle, so a
//! peer that was connected to our bound address sees our datagrams arrive
//! from the address it courts - mutual connects converge onto a single
//! peering per side.
//!
//! Peering lifecycle per datagram: OHAI courts, OHAI-OK accepts (echoing
//! the courted address so broadcast replies can be matched), HUGZ probes
//! after a third of the timeout without outbound traffic, and any inbound
//! datagram pushes the peer's death out by the full timeout. ROTFL refuses
//! a peer for good. Requests carry a 4-bit sequence; retransmissions set
//! the RESEND flag and replies to already-answered sequences are replayed
//! from the stored reply without redelivery.

pub mod wire;

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;
use std::time::Instant;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, info, trace, warn};

use crate::config::DriverConfig;
use crate::endpoint::{self, WILDCARD};
use crate::error::{VtxError, status};
use crate::frame::{self, Frame, Message};
use crate::pattern::{Pattern, Routing};
use crate::peering::Peering;
use crate::registry::{ControlCommand, ControlRequest, DriverContext};
use crate::vocket::Vocket;

/// Datagrams or messages processed per handle per iteration.
const BATCH_LIMIT: usize = 64;

/// Upper bound on the poll timeout; timers are exact to this granularity.
const POLL_GRANULARITY_MS: u64 = 100;

/// Transport state of one UDP peering.
pub struct UdpLink {
    /// Where datagrams for this peering go.
    pub addr: SocketAddr,
    /// The broadcast target to fall back to when an unfocused courtship
    /// has to restart.
    pub broadcast_addr: Option<SocketAddr>,
}

/// Bindings share the vocket's handle; nothing extra to hold.
pub struct UdpBinding;

struct VocketState {
    core: Vocket<UdpLink, UdpBinding>,
    socket: Option<UdpSocket>,
}

/// Build the driver entry point for `Vtx::register`.
pub fn driver(config: DriverConfig) -> impl FnOnce(DriverContext) + Send + 'static {
    move |ctx| {
        let scheme = ctx.scheme.clone();
        info!(scheme = %scheme, "udp driver starting");
        UdpDriver::new(ctx, config).run();
        info!(scheme = %scheme, "udp driver stopped");
    }
}

struct UdpDriver {
    scheme: String,
    config: DriverConfig,
    ctx: DriverContext,
    vockets: Vec<Option<VocketState>>,
    names: HashMap<String, usize>,
    bad_datagrams: u64,
    shutdown: bool,
}

impl UdpDriver {
    fn new(ctx: DriverContext, config: DriverConfig) -> Self {
        UdpDriver {
            scheme: ctx.scheme.clone(),
            config,
            ctx,
            vockets: Vec::new(),
            names: HashMap::new(),
            bad_datagrams: 0,
            shutdown: false,
        }
    }

    fn run(&mut self) {
        loop {
            self.poll_once();
            self.process_control();
            if self.shutdown {
                break;
            }
            self.process_sockets();
            self.process_mailboxes();
            self.process_timers();
            self.flush_pending();
        }
    }

    /// Sleep in poll until a handle is ready or the next timer is due.
    fn poll_once(&mut self) {
        let mut fds = Vec::new();
        fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(self.ctx.control.poll_fd()) },
            PollFlags::POLLIN,
        ));
        for state in self.vockets.iter().flatten() {
            if let Some(socket) = &state.socket {
                let mut events = PollFlags::POLLIN;
                let backlog = state
                    .core
                    .peering_keys()
                    .iter()
                    .any(|k| state.core.peering(k).is_some_and(|p| !p.pending.is_empty()));
                if backlog {
                    events |= PollFlags::POLLOUT;
                }
                fds.push(PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) },
                    events,
                ));
            }
            if state.core.gated_in()
                && let Some(pipe) = &state.core.pipe
            {
                fds.push(PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(pipe.from_app.poll_fd()) },
                    PollFlags::POLLIN,
                ));
            }
        }

        let now = Instant::now();
        let timeout_ms = match self.next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(now)
                .as_millis()
                .min(POLL_GRANULARITY_MS as u128) as u16,
            None => POLL_GRANULARITY_MS as u16,
        };
        if let Err(err) = poll(&mut fds, PollTimeout::from(timeout_ms)) {
            trace!(error = %err, "poll interrupted");
        }
        self.ctx.control.clear_signal();
    }

    /// Earliest peering timer across all vockets.
    fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |at: Instant| {
            next = Some(match next {
                Some(cur) if cur <= at => cur,
                _ => at,
            });
        };
        for state in self.vockets.iter().flatten() {
            let request_routing = state.core.profile.routing == Routing::Request;
            for key in state.core.peering_keys() {
                let Some(p) = state.core.peering(&key) else {
                    continue;
                };
                if !p.alive {
                    if p.outgoing {
                        consider(p.retry_at);
                    }
                } else {
                    consider(p.expiry);
                    consider(p.silent_by);
                    if request_routing && p.request.is_some() {
                        consider(p.resend_at);
                    }
                }
            }
        }
        next
    }

    // ------------------------------------------------------------------
    //  Control mailbox

    fn process_control(&mut self) {
        while let Ok(mut request) = self.ctx.control.try_recv() {
            match request.command {
                ControlCommand::Shutdown => {
                    request.respond(status::OK);
                    self.shutdown = true;
                    return;
                }
                ControlCommand::Bind | ControlCommand::Connect => {
                    let idx = match self.vocket_require(&mut request) {
                        Ok(idx) => idx,
                        Err(code) => {
                            request.respond(code);
                            continue;
                        }
                    };
                    let result = if request.command == ControlCommand::Bind {
                        self.handle_bind(idx, &request.address)
                    } else {
                        self.handle_connect(idx, &request.address)
                    };
                    match result {
                        Ok(()) => request.respond(status::OK),
                        Err(err) => {
                            warn!(
                                vocket = %request.vocket,
                                address = %request.address,
                                error = %err,
                                "control command failed"
                            );
                            request.respond(err.status());
                        }
                    }
                }
                ControlCommand::Close => {
                    if let Some(idx) = self.names.remove(&request.vocket) {
                        if let Some(state) = self.vockets[idx].take() {
                            info!(vocket = %state.core.name, "destroy vocket");
                        }
                    }
                    request.respond(status::OK);
                }
                ControlCommand::Getmeta => {
                    let reply = self
                        .names
                        .get(&request.vocket)
                        .and_then(|&idx| self.vockets[idx].as_ref())
                        .ok_or(VtxError::NoSuchMeta(request.address.clone()))
                        .and_then(|state| state.core.getmeta(&request.address));
                    match reply {
                        Ok(value) => request.respond_value(status::OK, value),
                        Err(err) => request.respond(err.status()),
                    }
                }
            }
        }
    }

    /// Look up the vocket a control request names, creating it on first
    /// contact.
    fn vocket_require(&mut self, request: &mut ControlRequest) -> Result<usize, i32> {
        if let Some(&idx) = self.names.get(&request.vocket) {
            return Ok(idx);
        }
        let Some(pattern) = Pattern::from_code(request.pattern) else {
            error!(code = request.pattern, "invalid socket pattern code");
            return Err(status::INTERNAL);
        };
        let core = Vocket::new(
            request.vocket.clone(),
            self.scheme.clone(),
            pattern,
            request.pipe.take(),
        );
        info!(vocket = %request.vocket, pattern = ?pattern, "create vocket");
        let idx = self.vockets.len();
        self.vockets.push(Some(VocketState { core, socket: None }));
        self.names.insert(request.vocket.clone(), idx);
        Ok(idx)
    }

    fn handle_bind(&mut self, idx: usize, address: &str) -> Result<(), VtxError> {
        let (host, port) = endpoint::split_address(address)?;
        let local = if host == WILDCARD {
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            endpoint::resolve(host, port)?
        };
        let state = self.vockets[idx].as_mut().expect("vocket exists");
        if state.core.bindings.contains_key(address) {
            return Ok(()); // idempotent re-bind
        }
        if state.socket.is_some() {
            // One handle per vocket, and it is already placed
            return Err(VtxError::InvalidEndpoint(address.to_string()));
        }
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        state.socket = Some(socket);
        state.core.bindings.insert(
            address.to_string(),
            crate::vocket::Binding {
                address: address.to_string(),
                link: UdpBinding,
            },
        );
        info!(vocket = %state.core.name, address, "create binding");
        Ok(())
    }

    fn handle_connect(&mut self, idx: usize, address: &str) -> Result<(), VtxError> {
        let (host, port) = endpoint::split_address(address)?;
        let wildcard = host == WILDCARD;
        let target = if wildcard {
            endpoint::broadcast(port)
        } else {
            endpoint::resolve(host, port)?
        };
        let key = endpoint::format_addr(&target);

        let now = Instant::now();
        let pending_limit = self.config.pending_limit;
        let state = self.vockets[idx].as_mut().expect("vocket exists");
        // Idempotent reconnect: directly, or through the focused identity
        // of a broadcast peering created under this key
        if state.core.peering(&key).is_some() {
            return Ok(());
        }
        if state.core.peering_keys().iter().any(|k| {
            state
                .core
                .peering(k)
                .is_some_and(|p| p.broadcast.as_deref() == Some(key.as_str()))
        }) {
            return Ok(());
        }
        if !state.core.peering_capacity_left() {
            return Err(VtxError::TooManyPeerings(state.core.profile.max_peerings));
        }
        if state.socket.is_none() {
            let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
            socket.set_nonblocking(true)?;
            state.socket = Some(socket);
        }
        if wildcard {
            state
                .socket
                .as_ref()
                .expect("socket just ensured")
                .set_broadcast(true)?;
        }
        let link = UdpLink {
            addr: target,
            broadcast_addr: wildcard.then_some(target),
        };
        let peering = Peering::new(
            key.clone(),
            true,
            wildcard.then(|| key.clone()),
            pending_limit,
            link,
            now,
        );
        state.core.insert_peering(peering)?;
        self.send_ohai(idx, &key, now);
        Ok(())
    }

    // ------------------------------------------------------------------
    //  Network input

    fn process_sockets(&mut self) {
        let mut buf = vec![0u8; 65536];
        for idx in 0..self.vockets.len() {
            for _ in 0..BATCH_LIMIT {
                let received = {
                    let Some(state) = self.vockets[idx].as_ref() else {
                        break;
                    };
                    let Some(socket) = &state.socket else {
                        break;
                    };
                    socket.recv_from(&mut buf)
                };
                match received {
                    Ok((size, peer)) => {
                        let datagram = buf[..size].to_vec();
                        self.handle_datagram(idx, peer, &datagram);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(error = %err, "recv error, ignoring");
                        break;
                    }
                }
            }
        }
    }

    fn handle_datagram(&mut self, idx: usize, peer: SocketAddr, datagram: &[u8]) {
        let (header, body) = match wire::decode(datagram) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.bad_datagrams += 1;
                debug!(
                    peer = %peer,
                    total = self.bad_datagrams,
                    "malformed datagram dropped"
                );
                return;
            }
        };
        let key = endpoint::format_addr(&peer);
        let now = Instant::now();
        trace!(peer = %key, command = ?header.command, seq = header.sequence, "datagram in");
        match header.command {
            wire::Command::Ohai => self.on_ohai(idx, peer, key, body, now),
            wire::Command::OhaiOk => self.on_ohai_ok(idx, peer, key, body, now),
            wire::Command::Hugz => self.on_hugz(idx, peer, key, now),
            wire::Command::HugzOk => self.touch_peer(idx, &key, now),
            wire::Command::Nom => self.on_nom(idx, key, header, body, now),
            wire::Command::Rotfl => self.on_rotfl(idx, key, body),
        }
    }

    fn on_ohai(&mut self, idx: usize, peer: SocketAddr, key: String, body: &[u8], now: Instant) {
        let pending_limit = self.config.pending_limit;
        let refused = {
            let Some(state) = self.vockets[idx].as_mut() else {
                return;
            };
            if state.core.peering(&key).is_none() {
                if !state.core.peering_capacity_left() {
                    warn!(vocket = %state.core.name, peer = %key, "max peerings reached, refusing");
                    true
                } else {
                    let link = UdpLink {
                        addr: peer,
                        broadcast_addr: None,
                    };
                    let peering = Peering::new(key.clone(), false, None, pending_limit, link, now);
                    state
                        .core
                        .insert_peering(peering)
                        .expect("capacity checked");
                    false
                }
            } else {
                false
            }
        };
        if refused {
            self.send_command(idx, peer, wire::Command::Rotfl, b"max peerings reached");
            return;
        }
        self.touch_peer(idx, &key, now);
        self.raise(idx, &key);
        // Echo the courted address so a broadcast OHAI can be correlated
        self.send_command(idx, peer, wire::Command::OhaiOk, body);
        self.note_sent(idx, &key, now);
    }

    fn on_ohai_ok(&mut self, idx: usize, peer: SocketAddr, key: String, body: &[u8], now: Instant) {
        {
            let Some(state) = self.vockets[idx].as_mut() else {
                return;
            };
            if state.core.peering(&key).is_none() {
                // The echoed body names the address we courted; focus the
                // broadcast peering onto this concrete responder
                let courted = String::from_utf8_lossy(body).to_string();
                let is_broadcast = state
                    .core
                    .peering(&courted)
                    .is_some_and(|p| p.broadcast.is_some());
                if !is_broadcast {
                    debug!(peer = %key, "stray OHAI-OK dropped");
                    return;
                }
                info!(from = %courted, to = %key, "focus broadcast peering");
                state.core.rekey_peering(&courted, key.clone());
                let p = state.core.peering_mut(&key).expect("just rekeyed");
                p.link.addr = peer;
            }
        }
        self.touch_peer(idx, &key, now);
        self.raise(idx, &key);
    }

    fn on_hugz(&mut self, idx: usize, peer: SocketAddr, key: String, now: Instant) {
        let known = self.vockets[idx]
            .as_ref()
            .is_some_and(|s| s.core.peering(&key).is_some());
        if !known {
            self.send_command(idx, peer, wire::Command::Rotfl, b"unknown peer");
            return;
        }
        self.touch_peer(idx, &key, now);
        self.send_command(idx, peer, wire::Command::HugzOk, &[]);
        self.note_sent(idx, &key, now);
    }

    fn on_nom(&mut self, idx: usize, key: String, header: wire::Header, body: &[u8], now: Instant) {
        let known = self.vockets[idx]
            .as_ref()
            .is_some_and(|s| s.core.peering(&key).is_some());
        if !known {
            if let Ok(addr) = key.parse::<SocketAddr>() {
                self.send_command(idx, addr, wire::Command::Rotfl, b"unknown peer");
            }
            return;
        }
        let Some(state) = self.vockets[idx].as_mut() else {
            return;
        };

        let resend = header.flags & wire::FLAG_RESEND != 0;
        let routing = state.core.profile.routing;
        let duplicate = {
            let p = state.core.peering_mut(&key).expect("checked above");
            p.touch_recv(now, self.config.timeout());
            match routing {
                // A reply to our in-flight request: same sequence again
                // means a duplicate
                Routing::Request => {
                    if p.recv_seq == Some(header.sequence) {
                        true
                    } else {
                        p.recv_seq = Some(header.sequence);
                        p.request = None;
                        false
                    }
                }
                // A request: a flagged retransmission of the sequence we
                // already answered is served from the stored reply
                Routing::Reply | Routing::Dealer | Routing::Router => {
                    if resend && p.recv_seq == Some(header.sequence) && p.reply.is_some() {
                        true
                    } else {
                        p.recv_seq = Some(header.sequence);
                        false
                    }
                }
                _ => {
                    p.recv_seq = Some(header.sequence);
                    false
                }
            }
        };
        self.raise(idx, &key);

        if duplicate {
            match routing {
                Routing::Reply | Routing::Dealer | Routing::Router => {
                    debug!(peer = %key, seq = header.sequence, "duplicate request, replaying reply");
                    self.replay_reply(idx, &key, now);
                }
                _ => debug!(peer = %key, seq = header.sequence, "duplicate reply dropped"),
            }
            return;
        }

        let msg = match frame::decode_message(body) {
            Ok(msg) => msg,
            Err(_) => {
                self.bad_datagrams += 1;
                debug!(peer = %key, total = self.bad_datagrams, "corrupt NOM body dropped");
                return;
            }
        };
        self.deliver(idx, &key, msg);
    }

    fn on_rotfl(&mut self, idx: usize, key: String, body: &[u8]) {
        let reason = String::from_utf8_lossy(body).to_string();
        let Some(state) = self.vockets[idx].as_mut() else {
            return;
        };
        if state.core.peering(&key).is_some() {
            warn!(vocket = %state.core.name, peer = %key, reason = %reason, "peer refused us");
            state.core.remove_peering(&key);
        }
    }

    /// Hand a decoded message to the vocket and its application.
    fn deliver(&mut self, idx: usize, key: &str, msg: Message) {
        let Some(state) = self.vockets[idx].as_mut() else {
            return;
        };
        let Some(delivered) = state.core.deliver_inbound(key, msg) else {
            debug!(vocket = %state.core.name, peer = %key, "pattern refuses input, dropped");
            return;
        };
        if let Some(pipe) = &state.core.pipe
            && pipe.to_app.try_send(delivered).is_err()
        {
            warn!(vocket = %state.core.name, "app mailbox full, dropping message");
        }
    }

    // ------------------------------------------------------------------
    //  Application output

    fn process_mailboxes(&mut self) {
        for idx in 0..self.vockets.len() {
            {
                let Some(state) = self.vockets[idx].as_ref() else {
                    continue;
                };
                if !state.core.gated_in() {
                    continue;
                }
                let Some(pipe) = &state.core.pipe else {
                    continue;
                };
                pipe.from_app.clear_signal();
            }
            for _ in 0..BATCH_LIMIT {
                let msg = {
                    let Some(state) = self.vockets[idx].as_ref() else {
                        break;
                    };
                    // A peering may have just died; leave queued messages
                    // for when the vocket is ready again
                    if !state.core.gated_in() {
                        break;
                    }
                    let Some(pipe) = &state.core.pipe else {
                        break;
                    };
                    match pipe.from_app.try_recv() {
                        Ok(msg) => msg,
                        Err(_) => break,
                    }
                };
                self.route_and_send(idx, msg);
            }
        }
    }

    fn route_and_send(&mut self, idx: usize, msg: Message) {
        let now = Instant::now();
        let plan = {
            let Some(state) = self.vockets[idx].as_mut() else {
                return;
            };
            state.core.route_outgoing(msg)
        };
        match plan {
            crate::vocket::RoutePlan::Drop { reason, misuse } => {
                let name = self.vocket_name(idx);
                if misuse {
                    error!(vocket = %name, reason, "dropping message");
                } else {
                    warn!(vocket = %name, reason, "dropping message");
                }
            }
            crate::vocket::RoutePlan::Send { targets, msg, kind } => {
                let mut body = Vec::new();
                frame::encode_message(&msg, &mut body);
                if wire::HEADER_SIZE + body.len() > self.config.msg_max {
                    warn!(
                        vocket = %self.vocket_name(idx),
                        size = body.len(),
                        limit = self.config.msg_max,
                        "message exceeds datagram ceiling, dropping"
                    );
                    if kind == Routing::Request {
                        // Un-stick the request slot; this one can never fly
                        if let Some(state) = self.vockets[idx].as_mut() {
                            for key in &targets {
                                if let Some(p) = state.core.peering_mut(key) {
                                    p.request = None;
                                }
                            }
                        }
                    }
                    return;
                }
                for key in targets {
                    self.send_nom(idx, &key, kind, &body, now);
                }
            }
        }
    }

    fn send_nom(&mut self, idx: usize, key: &str, kind: Routing, body: &[u8], now: Instant) {
        let resend_ivl = self.config.resend_ivl();
        let sequence = {
            let Some(state) = self.vockets[idx].as_mut() else {
                return;
            };
            let Some(p) = state.core.peering_mut(key) else {
                return;
            };
            match kind {
                Routing::Request => {
                    p.resend_at = now + resend_ivl;
                    p.request_seq
                }
                Routing::Reply | Routing::Dealer | Routing::Router => p.reply_seq,
                _ => 0,
            }
        };
        let datagram = wire::encode(
            wire::Header {
                flags: 0,
                command: wire::Command::Nom,
                sequence,
            },
            body,
        );
        self.send_to_peering(idx, key, datagram, now);
    }

    // ------------------------------------------------------------------
    //  Timers

    fn process_timers(&mut self) {
        let now = Instant::now();
        for idx in 0..self.vockets.len() {
            let keys = match self.vockets[idx].as_ref() {
                Some(state) => state.core.peering_keys(),
                None => continue,
            };
            for key in keys {
                enum Due {
                    Nothing,
                    Court,
                    Probe,
                    Resend,
                    Expire,
                }
                let due = {
                    let Some(state) = self.vockets[idx].as_ref() else {
                        continue;
                    };
                    let request_routing = state.core.profile.routing == Routing::Request;
                    let Some(p) = state.core.peering(&key) else {
                        continue;
                    };
                    if !p.alive {
                        if p.outgoing && now >= p.retry_at {
                            Due::Court
                        } else {
                            Due::Nothing
                        }
                    } else if now >= p.expiry {
                        Due::Expire
                    } else if request_routing && p.request.is_some() && now >= p.resend_at {
                        Due::Resend
                    } else if now >= p.silent_by {
                        Due::Probe
                    } else {
                        Due::Nothing
                    }
                };
                match due {
                    Due::Nothing => {}
                    Due::Court => self.send_ohai(idx, &key, now),
                    Due::Probe => {
                        let addr = self.peering_addr(idx, &key);
                        if let Some(addr) = addr {
                            self.send_command(idx, addr, wire::Command::Hugz, &[]);
                            self.note_sent(idx, &key, now);
                        }
                    }
                    Due::Resend => self.resend_request(idx, &key, now),
                    Due::Expire => self.expire_peering(idx, &key, now),
                }
            }
        }
    }

    /// Court a dead outgoing peering: OHAI, then again at the retry
    /// interval.
    fn send_ohai(&mut self, idx: usize, key: &str, now: Instant) {
        let (addr, body) = {
            let Some(state) = self.vockets[idx].as_mut() else {
                return;
            };
            let Some(p) = state.core.peering_mut(key) else {
                return;
            };
            p.retry_at = now + self.config.ohai_ivl();
            (p.link.addr, p.address.clone().into_bytes())
        };
        trace!(peer = %key, "OHAI");
        self.send_command(idx, addr, wire::Command::Ohai, &body);
        self.note_sent(idx, key, now);
    }

    /// Retransmit the in-flight request with the RESEND flag.
    fn resend_request(&mut self, idx: usize, key: &str, now: Instant) {
        let (body, sequence) = {
            let Some(state) = self.vockets[idx].as_mut() else {
                return;
            };
            let Some(p) = state.core.peering_mut(key) else {
                return;
            };
            let Some(request) = &p.request else {
                return;
            };
            let mut body = Vec::new();
            frame::encode_message(request, &mut body);
            p.resend_at = now + self.config.resend_ivl();
            (body, p.request_seq)
        };
        debug!(peer = %key, seq = sequence, "resending request");
        let datagram = wire::encode(
            wire::Header {
                flags: wire::FLAG_RESEND,
                command: wire::Command::Nom,
                sequence,
            },
            &body,
        );
        self.send_to_peering(idx, key, datagram, now);
    }

    /// Serve a duplicate request from the stored reply.
    fn replay_reply(&mut self, idx: usize, key: &str, now: Instant) {
        let (body, sequence) = {
            let Some(state) = self.vockets[idx].as_ref() else {
                return;
            };
            let Some(p) = state.core.peering(key) else {
                return;
            };
            let Some(reply) = &p.reply else {
                return;
            };
            let mut body = Vec::new();
            frame::encode_message(reply, &mut body);
            (body, p.reply_seq)
        };
        let datagram = wire::encode(
            wire::Header {
                flags: wire::FLAG_RESEND,
                command: wire::Command::Nom,
                sequence,
            },
            &body,
        );
        self.send_to_peering(idx, key, datagram, now);
    }

    /// The peering timeout passed with no inbound traffic.
    fn expire_peering(&mut self, idx: usize, key: &str, now: Instant) {
        let Some(state) = self.vockets[idx].as_mut() else {
            return;
        };
        let Some(p) = state.core.peering(key) else {
            return;
        };
        let outgoing = p.outgoing;
        let focused = p.is_focused();
        info!(vocket = %state.core.name, peer = %key, "peering expired");
        if !outgoing {
            state.core.remove_peering(key);
            return;
        }
        state.core.lower_peering(key);
        if focused {
            // Back to the broadcast key to court a new responder
            let p = state.core.peering_mut(key).expect("still present");
            let bkey = p.broadcast.clone().expect("focused implies broadcast");
            if let Some(bcast) = p.link.broadcast_addr {
                p.link.addr = bcast;
            }
            p.retry_at = now;
            info!(from = %key, to = %bkey, "unfocus broadcast peering");
            state.core.rekey_peering(key, bkey);
        } else if let Some(p) = state.core.peering_mut(key) {
            p.retry_at = now;
        }
    }

    // ------------------------------------------------------------------
    //  Socket sends and error policy

    /// Fire-and-forget command to a bare address (OHAI-OK, HUGZ-OK, ROTFL).
    fn send_command(&mut self, idx: usize, addr: SocketAddr, command: wire::Command, body: &[u8]) {
        let Some(state) = self.vockets[idx].as_ref() else {
            return;
        };
        let Some(socket) = &state.socket else {
            return;
        };
        let datagram = wire::encode(
            wire::Header {
                flags: 0,
                command,
                sequence: 0,
            },
            body,
        );
        if let Err(err) = socket.send_to(&datagram, addr) {
            if !transient(err.kind()) {
                debug!(peer = %addr, error = %err, "command send failed");
            }
        }
    }

    /// Send a datagram to a peering, applying the transient/terminal error
    /// policy: transients queue for retry, terminal errors destroy the
    /// peering, everything else is logged and ignored.
    fn send_to_peering(&mut self, idx: usize, key: &str, datagram: Vec<u8>, now: Instant) {
        let outcome = {
            let Some(state) = self.vockets[idx].as_mut() else {
                return;
            };
            let Some(socket) = &state.socket else {
                return;
            };
            let Some(p) = state.core.peering_mut(key) else {
                return;
            };
            match socket.send_to(&datagram, p.link.addr) {
                Ok(_) => {
                    p.touch_send(now, self.config.keepalive());
                    Ok(())
                }
                Err(err) if transient(err.kind()) => {
                    p.pending.store(Frame::new(datagram, false));
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };
        if let Err(err) = outcome {
            if terminal(err.kind()) {
                warn!(peer = %key, error = %err, "terminal send error, destroying peering");
                if let Some(state) = self.vockets[idx].as_mut() {
                    state.core.remove_peering(key);
                }
            } else {
                debug!(peer = %key, error = %err, "send error, ignoring");
            }
        }
    }

    /// Retry queued datagrams now that the handle may be writable again.
    fn flush_pending(&mut self) {
        let now = Instant::now();
        for idx in 0..self.vockets.len() {
            let keys = match self.vockets[idx].as_ref() {
                Some(state) => state.core.peering_keys(),
                None => continue,
            };
            for key in keys {
                loop {
                    let sent = {
                        let Some(state) = self.vockets[idx].as_mut() else {
                            break;
                        };
                        let Some(socket) = &state.socket else {
                            break;
                        };
                        let Some(p) = state.core.peering_mut(&key) else {
                            break;
                        };
                        let Some(frame) = p.pending.oldest() else {
                            break;
                        };
                        match socket.send_to(&frame.data, p.link.addr) {
                            Ok(_) => {
                                p.pending.drop_oldest();
                                p.touch_send(now, self.config.keepalive());
                                true
                            }
                            Err(err) if transient(err.kind()) => false,
                            Err(err) => {
                                debug!(peer = %key, error = %err, "pending flush failed, dropping");
                                p.pending.drop_oldest();
                                false
                            }
                        }
                    };
                    if !sent {
                        break;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    //  Small helpers

    fn raise(&mut self, idx: usize, key: &str) {
        if let Some(state) = self.vockets[idx].as_mut() {
            state.core.raise_peering(key);
        }
    }

    fn touch_peer(&mut self, idx: usize, key: &str, now: Instant) {
        if let Some(state) = self.vockets[idx].as_mut()
            && let Some(p) = state.core.peering_mut(key)
        {
            p.touch_recv(now, self.config.timeout());
        }
    }

    fn note_sent(&mut self, idx: usize, key: &str, now: Instant) {
        if let Some(state) = self.vockets[idx].as_mut()
            && let Some(p) = state.core.peering_mut(key)
        {
            p.touch_send(now, self.config.keepalive());
        }
    }

    fn peering_addr(&self, idx: usize, key: &str) -> Option<SocketAddr> {
        self.vockets[idx]
            .as_ref()
            .and_then(|s| s.core.peering(key))
            .map(|p| p.link.addr)
    }

    fn vocket_name(&self, idx: usize) -> String {
        self.vockets[idx]
            .as_ref()
            .map(|s| s.core.name.clone())
            .unwrap_or_default()
    }
}

/// Ignore and retry later.
fn transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::NetworkDown
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
    )
}

/// The peer is gone for good.
fn terminal(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}
