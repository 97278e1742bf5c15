//! TCP driver: vockets over stream connections.
//!
//! The stream carries wire frames back to back with no per-connection
//! preamble; peering liveness is connection liveness, so the datagram
//! courtship protocol does not apply. Outgoing peerings reconnect on a
//! fixed interval after losing their connection; incoming peerings are
//! destroyed. Each peering pumps its stream through a pair of codecs: the
//! outbound codec batches frames until the socket is writable, the inbound
//! codec reassembles frames from whatever the socket delivers.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, info, trace, warn};

use crate::codec::Codec;
use crate::config::DriverConfig;
use crate::endpoint::{self, WILDCARD};
use crate::error::{VtxError, status};
use crate::frame::Message;
use crate::pattern::{Pattern, Routing};
use crate::peering::Peering;
use crate::registry::{ControlCommand, ControlRequest, DriverContext};
use crate::vocket::{Binding, RoutePlan, Vocket};

/// Messages or accepts processed per handle per iteration.
const BATCH_LIMIT: usize = 64;

/// Upper bound on the poll timeout.
const POLL_GRANULARITY_MS: u64 = 100;

/// Per-direction codec buffer on each peering.
const STREAM_BUFFER: usize = 64 * 1024;

/// Bound on a single blocking connect attempt; attempts are already rate
/// limited by the reconnect interval.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Transport state of one TCP peering.
pub struct TcpLink {
    pub addr: SocketAddr,
    stream: Option<TcpStream>,
    outq: Codec,
    inq: Codec,
    /// Frames of a partially received message.
    partial: Message,
}

impl TcpLink {
    fn new(addr: SocketAddr) -> Self {
        TcpLink {
            addr,
            stream: None,
            outq: Codec::new(STREAM_BUFFER),
            inq: Codec::new(STREAM_BUFFER),
            partial: Message::new(),
        }
    }
}

struct VocketState {
    core: Vocket<TcpLink, TcpListener>,
}

/// Build the driver entry point for `Vtx::register`.
pub fn driver(config: DriverConfig) -> impl FnOnce(DriverContext) + Send + 'static {
    move |ctx| {
        let scheme = ctx.scheme.clone();
        info!(scheme = %scheme, "tcp driver starting");
        TcpDriver::new(ctx, config).run();
        info!(scheme = %scheme, "tcp driver stopped");
    }
}

struct TcpDriver {
    scheme: String,
    config: DriverConfig,
    ctx: DriverContext,
    vockets: Vec<Option<VocketState>>,
    names: HashMap<String, usize>,
    shutdown: bool,
}

impl TcpDriver {
    fn new(ctx: DriverContext, config: DriverConfig) -> Self {
        TcpDriver {
            scheme: ctx.scheme.clone(),
            config,
            ctx,
            vockets: Vec::new(),
            names: HashMap::new(),
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
            self.process_bindings();
            self.process_streams();
            self.process_mailboxes();
            self.process_timers();
        }
    }

    fn poll_once(&mut self) {
        let mut fds = Vec::new();
        fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(self.ctx.control.poll_fd()) },
            PollFlags::POLLIN,
        ));
        for state in self.vockets.iter().flatten() {
            for binding in state.core.bindings.values() {
                fds.push(PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(binding.link.as_raw_fd()) },
                    PollFlags::POLLIN,
                ));
            }
            for key in state.core.peering_keys() {
                let Some(p) = state.core.peering(&key) else {
                    continue;
                };
                if let Some(stream) = &p.link.stream {
                    let mut events = PollFlags::POLLIN;
                    if p.link.outq.active() > 0 {
                        events |= PollFlags::POLLOUT;
                    }
                    fds.push(PollFd::new(
                        unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) },
                        events,
                    ));
                }
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

    fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        for state in self.vockets.iter().flatten() {
            for key in state.core.peering_keys() {
                let Some(p) = state.core.peering(&key) else {
                    continue;
                };
                if !p.alive && p.outgoing {
                    next = Some(match next {
                        Some(cur) if cur <= p.retry_at => cur,
                        _ => p.retry_at,
                    });
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
        self.vockets.push(Some(VocketState { core }));
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
        let listener = TcpListener::bind(local)?;
        listener.set_nonblocking(true)?;
        state.core.bindings.insert(
            address.to_string(),
            Binding {
                address: address.to_string(),
                link: listener,
            },
        );
        info!(vocket = %state.core.name, address, "create binding");
        Ok(())
    }

    fn handle_connect(&mut self, idx: usize, address: &str) -> Result<(), VtxError> {
        let (host, port) = endpoint::split_address(address)?;
        let target = endpoint::resolve(host, port)?;
        let key = endpoint::format_addr(&target);
        let now = Instant::now();
        let pending_limit = self.config.pending_limit;
        let state = self.vockets[idx].as_mut().expect("vocket exists");
        if state.core.peering(&key).is_some() {
            return Ok(()); // idempotent reconnect
        }
        if !state.core.peering_capacity_left() {
            return Err(VtxError::TooManyPeerings(state.core.profile.max_peerings));
        }
        let peering = Peering::new(
            key.clone(),
            true,
            None,
            pending_limit,
            TcpLink::new(target),
            now,
        );
        state.core.insert_peering(peering)?;
        self.try_connect(idx, &key, now);
        Ok(())
    }

    // ------------------------------------------------------------------
    //  Accept and connect

    fn process_bindings(&mut self) {
        let pending_limit = self.config.pending_limit;
        for idx in 0..self.vockets.len() {
            let addresses: Vec<String> = match self.vockets[idx].as_ref() {
                Some(state) => state.core.bindings.keys().cloned().collect(),
                None => continue,
            };
            for address in addresses {
                for _ in 0..BATCH_LIMIT {
                    let accepted = {
                        let Some(state) = self.vockets[idx].as_ref() else {
                            break;
                        };
                        let Some(binding) = state.core.bindings.get(&address) else {
                            break;
                        };
                        binding.link.accept()
                    };
                    match accepted {
                        Ok((stream, peer)) => {
                            self.admit(idx, stream, peer, pending_limit);
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            debug!(error = %err, "accept error, ignoring");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Take an accepted connection in as an incoming peering.
    fn admit(&mut self, idx: usize, stream: TcpStream, peer: SocketAddr, pending_limit: usize) {
        let now = Instant::now();
        let key = endpoint::format_addr(&peer);
        let Some(state) = self.vockets[idx].as_mut() else {
            return;
        };
        if !state.core.peering_capacity_left() {
            // No command channel on a raw stream; just refuse the
            // connection
            warn!(vocket = %state.core.name, peer = %key, "max peerings reached, refusing");
            drop(stream);
            return;
        }
        if stream.set_nonblocking(true).is_err() {
            return;
        }
        let _ = stream.set_nodelay(true);
        let mut link = TcpLink::new(peer);
        link.stream = Some(stream);
        let peering = Peering::new(key.clone(), false, None, pending_limit, link, now);
        if state.core.insert_peering(peering).is_ok() {
            state.core.raise_peering(&key);
        }
    }

    /// One bounded connect attempt for a dead outgoing peering.
    fn try_connect(&mut self, idx: usize, key: &str, now: Instant) {
        let reconnect = self.config.reconnect_ivl();
        let Some(state) = self.vockets[idx].as_mut() else {
            return;
        };
        let Some(p) = state.core.peering_mut(key) else {
            return;
        };
        p.retry_at = now + reconnect;
        debug!(peer = %key, "connecting");
        match TcpStream::connect_timeout(&p.link.addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                if stream.set_nonblocking(true).is_err() {
                    return;
                }
                let _ = stream.set_nodelay(true);
                p.link.stream = Some(stream);
                state.core.raise_peering(key);
            }
            Err(err) => {
                debug!(peer = %key, error = %err, "connect failed, will retry");
            }
        }
    }

    // ------------------------------------------------------------------
    //  Stream I/O

    fn process_streams(&mut self) {
        for idx in 0..self.vockets.len() {
            let keys = match self.vockets[idx].as_ref() {
                Some(state) => state.core.peering_keys(),
                None => continue,
            };
            for key in keys {
                let mut failed = false;
                if let Some(state) = self.vockets[idx].as_mut()
                    && let Some(p) = state.core.peering_mut(&key)
                    && p.link.stream.is_some()
                {
                    failed = pump_write(p) || pump_read(p);
                }
                if failed {
                    self.drop_connection(idx, &key);
                    continue;
                }
                self.deliver_assembled(idx, &key);
            }
        }
    }

    /// Move complete messages out of the peering's inbound codec.
    fn deliver_assembled(&mut self, idx: usize, key: &str) {
        let mut assembled = Vec::new();
        let mut broken = false;
        {
            let Some(state) = self.vockets[idx].as_mut() else {
                return;
            };
            let routing = state.core.profile.routing;
            let Some(p) = state.core.peering_mut(key) else {
                return;
            };
            loop {
                match p.link.inq.get_frame() {
                    Ok(frame) => {
                        let more = frame.more;
                        p.link.partial.push(frame);
                        if !more {
                            let msg = std::mem::take(&mut p.link.partial);
                            // A stream reply satisfies the in-flight
                            // request
                            if routing == Routing::Request {
                                p.request = None;
                            }
                            assembled.push(msg);
                        }
                    }
                    Err(VtxError::Empty) => {
                        // A frame that can never fit the inbound buffer
                        // cannot be resynchronized either
                        if p.link.inq.space() == 0 {
                            warn!(peer = %key, "oversized frame on stream");
                            broken = true;
                        }
                        break;
                    }
                    Err(_) => {
                        warn!(peer = %key, "corrupt stream framing");
                        broken = true;
                        break;
                    }
                }
            }
        }
        for msg in assembled {
            let Some(state) = self.vockets[idx].as_mut() else {
                return;
            };
            let Some(delivered) = state.core.deliver_inbound(key, msg) else {
                continue;
            };
            if let Some(pipe) = &state.core.pipe
                && pipe.to_app.try_send(delivered).is_err()
            {
                warn!(vocket = %state.core.name, "app mailbox full, dropping message");
            }
        }
        if broken {
            self.drop_connection(idx, key);
        }
    }

    /// Lost connection: lower the peering, keep courting if it was ours.
    fn drop_connection(&mut self, idx: usize, key: &str) {
        let now = Instant::now();
        let reconnect = self.config.reconnect_ivl();
        let Some(state) = self.vockets[idx].as_mut() else {
            return;
        };
        let Some(p) = state.core.peering_mut(key) else {
            return;
        };
        p.link.stream = None;
        p.link.partial.clear();
        let outgoing = p.outgoing;
        info!(vocket = %state.core.name, peer = %key, "connection lost");
        state.core.lower_peering(key);
        if outgoing {
            if let Some(p) = state.core.peering_mut(key) {
                p.retry_at = now + reconnect;
            }
        } else {
            state.core.remove_peering(key);
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
        let plan = {
            let Some(state) = self.vockets[idx].as_mut() else {
                return;
            };
            state.core.route_outgoing(msg)
        };
        match plan {
            RoutePlan::Drop { reason, misuse } => {
                let name = self
                    .vockets[idx]
                    .as_ref()
                    .map(|s| s.core.name.clone())
                    .unwrap_or_default();
                if misuse {
                    error!(vocket = %name, reason, "dropping message");
                } else {
                    warn!(vocket = %name, reason, "dropping message");
                }
            }
            RoutePlan::Send { targets, msg, .. } => {
                for key in &targets {
                    let mut failed = false;
                    {
                        let Some(state) = self.vockets[idx].as_mut() else {
                            return;
                        };
                        let Some(p) = state.core.peering_mut(key) else {
                            continue;
                        };
                        if !p.link.outq.frames_fit(&msg) {
                            warn!(peer = %key, "outbound buffer full, dropping message");
                            continue;
                        }
                        for frame in msg.iter().cloned() {
                            if p.link.outq.put_frame(frame).is_err() {
                                // frames_fit said yes; treat as fatal for
                                // this connection rather than corrupt it
                                failed = true;
                                break;
                            }
                        }
                        if !failed {
                            failed = pump_write(p);
                        }
                    }
                    if failed {
                        self.drop_connection(idx, key);
                    }
                }
            }
        }
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
                let due = {
                    let Some(state) = self.vockets[idx].as_ref() else {
                        continue;
                    };
                    let Some(p) = state.core.peering(&key) else {
                        continue;
                    };
                    !p.alive && p.outgoing && now >= p.retry_at
                };
                if due {
                    self.try_connect(idx, &key, now);
                }
            }
        }
    }
}

/// Drain the outbound codec into the stream. True means the connection
/// failed.
fn pump_write(p: &mut Peering<TcpLink>) -> bool {
    let Some(stream) = p.link.stream.as_mut() else {
        return false;
    };
    loop {
        let chunk_len = match p.link.outq.get_bytes() {
            Ok(chunk) if chunk.is_empty() => return false,
            Ok(chunk) => match stream.write(chunk) {
                Ok(0) => return true,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(error = %err, "stream write failed");
                    return true;
                }
            },
            Err(_) => return false, // nothing buffered
        };
        p.link.outq.tick(chunk_len);
    }
}

/// Read whatever the stream has into the inbound codec. True means the
/// connection failed.
fn pump_read(p: &mut Peering<TcpLink>) -> bool {
    let Some(stream) = p.link.stream.as_mut() else {
        return false;
    };
    let mut buf = [0u8; 4096];
    loop {
        let space = p.link.inq.space();
        if space == 0 {
            // Let the delivery side drain before reading more
            return false;
        }
        let want = space.min(buf.len());
        match stream.read(&mut buf[..want]) {
            Ok(0) => return true, // peer closed
            Ok(n) => {
                if p.link.inq.put_bytes(&buf[..n]).is_err() {
                    return false;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(error = %err, "stream read failed");
                return true;
            }
        }
    }
}
