//! The VTX front: scheme registry, driver threads, and the control
//! protocol between application and drivers.
//!
//! `register` spawns one named driver thread per scheme and keeps its
//! control mailbox. `socket` creates an application-side handle with a
//! fresh mailbox pair; the first `bind` or `connect` hands the driver-side
//! endpoints to the scheme's driver, which creates the vocket. Control
//! commands are synchronous: each request carries a one-shot reply channel
//! and the caller blocks on it.

use std::collections::HashMap;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use tracing::{info, warn};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::{VtxError, status};
use crate::frame::{Frame, Message};
use crate::mailbox::{MAILBOX_CAPACITY, MailboxReceiver, MailboxSender, mailbox};
use crate::pattern::Pattern;
use crate::vocket::VocketPipe;

/// Control requests queued per driver before senders block.
pub const CONTROL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Bind,
    Connect,
    Close,
    Getmeta,
    Shutdown,
}

/// Four-field control request, plus the reply channel and (on a vocket's
/// first command) the driver-side mailbox endpoints.
pub struct ControlRequest {
    pub command: ControlCommand,
    /// Socket-pattern code, as `Pattern::code`.
    pub pattern: u8,
    /// Opaque vocket name.
    pub vocket: String,
    /// `host:port` (no scheme), or the metadata name for Getmeta.
    pub address: String,
    pub pipe: Option<VocketPipe>,
    reply: Sender<ControlReply>,
}

pub struct ControlReply {
    pub status: i32,
    pub value: Option<String>,
}

impl ControlRequest {
    /// Answer with a bare status code.
    pub fn respond(&self, status: i32) {
        let _ = self.reply.send(ControlReply {
            status,
            value: None,
        });
    }

    /// Answer with a status code and a value (Getmeta).
    pub fn respond_value(&self, status: i32, value: String) {
        let _ = self.reply.send(ControlReply {
            status,
            value: Some(value),
        });
    }
}

/// What a driver thread receives at startup.
pub struct DriverContext {
    pub scheme: String,
    pub control: MailboxReceiver<ControlRequest>,
}

struct DriverHandle {
    control: MailboxSender<ControlRequest>,
    thread: Option<JoinHandle<()>>,
}

/// The process-wide driver registry.
pub struct Vtx {
    drivers: HashMap<String, DriverHandle>,
}

impl Default for Vtx {
    fn default() -> Self {
        Self::new()
    }
}

impl Vtx {
    pub fn new() -> Self {
        Vtx {
            drivers: HashMap::new(),
        }
    }

    /// Register a driver for `scheme`, spawning its thread. A second
    /// registration for the same scheme is refused.
    pub fn register<F>(&mut self, scheme: &str, driver_fn: F) -> Result<(), VtxError>
    where
        F: FnOnce(DriverContext) + Send + 'static,
    {
        if self.drivers.contains_key(scheme) {
            return Err(VtxError::NotUnique(scheme.to_string()));
        }
        let (control_tx, control_rx) = mailbox(CONTROL_CAPACITY)?;
        let ctx = DriverContext {
            scheme: scheme.to_string(),
            control: control_rx,
        };
        // Channel to signal when the driver thread is up
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<()>(0);
        let thread = thread::Builder::new()
            .name(format!("vtx-{scheme}"))
            .spawn(move || {
                let _ = ready_tx.send(());
                driver_fn(ctx);
            })?;
        if ready_rx.recv_timeout(Duration::from_secs(5)).is_err() {
            warn!(scheme, "driver thread did not start");
            return Err(VtxError::DriverGone);
        }
        info!(scheme, "registered driver");
        self.drivers.insert(
            scheme.to_string(),
            DriverHandle {
                control: control_tx,
                thread: Some(thread),
            },
        );
        Ok(())
    }

    /// Create a vocket handle. Driver affinity is fixed by the first bind
    /// or connect.
    pub fn socket(&self, pattern: Pattern) -> Result<VtxSocket, VtxError> {
        let (to_driver, from_app) = mailbox(MAILBOX_CAPACITY)?;
        let (to_app, from_driver) = bounded(MAILBOX_CAPACITY);
        Ok(VtxSocket {
            name: format!("vtx-{}", Uuid::new_v4()),
            pattern,
            scheme: None,
            to_driver,
            from_driver,
            pipe: Some(VocketPipe { from_app, to_app }),
        })
    }

    pub fn bind(&self, socket: &mut VtxSocket, endpoint: &str) -> Result<(), VtxError> {
        self.driver_call(socket, ControlCommand::Bind, endpoint)
    }

    pub fn connect(&self, socket: &mut VtxSocket, endpoint: &str) -> Result<(), VtxError> {
        self.driver_call(socket, ControlCommand::Connect, endpoint)
    }

    /// Destroy the vocket behind a handle. A handle that never bound or
    /// connected has no driver state to destroy.
    pub fn close(&self, socket: &mut VtxSocket) -> Result<(), VtxError> {
        let Some(scheme) = socket.scheme.clone() else {
            return Ok(());
        };
        let reply = self.request(
            &scheme,
            ControlCommand::Close,
            socket,
            String::new(),
            None,
        )?;
        match VtxError::from_status(reply.status, "") {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Fetch vocket metadata, e.g. `"sender"`.
    pub fn getmeta(&self, socket: &VtxSocket, name: &str) -> Result<String, VtxError> {
        let Some(scheme) = socket.scheme.clone() else {
            return Err(VtxError::NoSuchProtocol(String::new()));
        };
        let reply = self.request(
            &scheme,
            ControlCommand::Getmeta,
            socket,
            name.to_string(),
            None,
        )?;
        match VtxError::from_status(reply.status, name) {
            None => Ok(reply.value.unwrap_or_default()),
            Some(err) => Err(err),
        }
    }

    fn driver_call(
        &self,
        socket: &mut VtxSocket,
        command: ControlCommand,
        endpoint: &str,
    ) -> Result<(), VtxError> {
        let ep = Endpoint::parse(endpoint)?;
        if let Some(bound) = &socket.scheme
            && *bound != ep.scheme
        {
            return Err(VtxError::SchemeMismatch {
                bound: bound.clone(),
                requested: ep.scheme,
            });
        }
        if !self.drivers.contains_key(&ep.scheme) {
            return Err(VtxError::NoSuchProtocol(ep.scheme));
        }
        let pipe = socket.pipe.take();
        let address = ep.address();
        let reply = self.request(&ep.scheme, command, socket, ep.address(), pipe)?;
        // The vocket now exists inside this driver, whatever the status:
        // the handle's scheme affinity is fixed
        socket.scheme = Some(ep.scheme);
        match VtxError::from_status(reply.status, &address) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn request(
        &self,
        scheme: &str,
        command: ControlCommand,
        socket: &VtxSocket,
        address: String,
        pipe: Option<VocketPipe>,
    ) -> Result<ControlReply, VtxError> {
        let handle = self
            .drivers
            .get(scheme)
            .ok_or_else(|| VtxError::NoSuchProtocol(scheme.to_string()))?;
        let (reply_tx, reply_rx) = bounded(1);
        handle
            .control
            .send(ControlRequest {
                command,
                pattern: socket.pattern.code(),
                vocket: socket.name.clone(),
                address,
                pipe,
                reply: reply_tx,
            })
            .map_err(|_| VtxError::DriverGone)?;
        reply_rx.recv().map_err(|_| VtxError::DriverGone)
    }

    /// Stop every driver thread and wait for them.
    pub fn shutdown(&mut self) {
        for (scheme, handle) in self.drivers.drain() {
            let (reply_tx, reply_rx) = bounded(1);
            let sent = handle
                .control
                .send(ControlRequest {
                    command: ControlCommand::Shutdown,
                    pattern: 0,
                    vocket: String::new(),
                    address: String::new(),
                    pipe: None,
                    reply: reply_tx,
                })
                .is_ok();
            if sent {
                let _ = reply_rx.recv_timeout(Duration::from_secs(5));
            }
            if let Some(thread) = handle.thread {
                if thread.join().is_err() {
                    warn!(scheme = %scheme, "driver thread panicked");
                }
            }
        }
    }
}

impl Drop for Vtx {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Application-side handle to one vocket.
pub struct VtxSocket {
    name: String,
    pattern: Pattern,
    scheme: Option<String>,
    to_driver: MailboxSender<Message>,
    from_driver: Receiver<Message>,
    pipe: Option<VocketPipe>,
}

impl VtxSocket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    /// Queue a message for the driver. Blocks at the mailbox high-water
    /// mark. A message needs at least one frame.
    pub fn send(&self, msg: Message) -> Result<(), VtxError> {
        if msg.is_empty() {
            return Err(VtxError::Empty);
        }
        self.to_driver.send(msg).map_err(|_| VtxError::DriverGone)
    }

    /// Queue a single-frame message.
    pub fn send_bytes(&self, data: impl Into<Vec<u8>>) -> Result<(), VtxError> {
        self.send(vec![Frame::new(data, false)])
    }

    /// Blocking receive of one whole message.
    pub fn recv(&self) -> Result<Message, VtxError> {
        self.from_driver.recv().map_err(|_| VtxError::DriverGone)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Message, VtxError> {
        self.from_driver.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => VtxError::Timeout,
            RecvTimeoutError::Disconnected => VtxError::DriverGone,
        })
    }

    pub fn try_recv(&self) -> Result<Message, VtxError> {
        self.from_driver.try_recv().map_err(|err| match err {
            TryRecvError::Empty => VtxError::Empty,
            TryRecvError::Disconnected => VtxError::DriverGone,
        })
    }
}
