//! Mailboxes between application threads and driver threads.
//!
//! A mailbox pairs a bounded crossbeam channel with an eventfd so a poll
//! based reactor can sleep on the receiving side. Senders signal the
//! eventfd after every enqueue; the reactor polls the eventfd, drains it,
//! then drains the channel.
//!
//! The channel bound is the mailbox high-water mark: `send` blocks the
//! producer when the consumer falls behind, which is all the backpressure
//! the vocket layer needs.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crossbeam_channel::{Receiver, SendError, Sender, TryRecvError, TrySendError, bounded};

/// Default mailbox high-water mark, in whole messages.
pub const MAILBOX_CAPACITY: usize = 1024;

/// Sending half: clonable, signals the receiver's eventfd on every send.
pub struct MailboxSender<T> {
    tx: Sender<T>,
    eventfd: RawFd,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        MailboxSender {
            tx: self.tx.clone(),
            eventfd: self.eventfd,
        }
    }
}

/// Receiving half: owns the eventfd polled by the reactor.
pub struct MailboxReceiver<T> {
    rx: Receiver<T>,
    eventfd: OwnedFd,
}

/// Create a mailbox with the given high-water mark.
pub fn mailbox<T>(capacity: usize) -> io::Result<(MailboxSender<T>, MailboxReceiver<T>)> {
    let eventfd = unsafe {
        let fd = nix::libc::eventfd(0, nix::libc::EFD_NONBLOCK);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        OwnedFd::from_raw_fd(fd)
    };
    let (tx, rx) = bounded(capacity);
    let sender = MailboxSender {
        tx,
        eventfd: eventfd.as_raw_fd(),
    };
    let receiver = MailboxReceiver { rx, eventfd };
    Ok((sender, receiver))
}

impl<T> MailboxSender<T> {
    /// Enqueue a message, blocking at the high-water mark, then wake the
    /// receiver.
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        self.tx.send(msg)?;
        self.signal();
        Ok(())
    }

    /// Enqueue without blocking; the reactor side uses this and drops on a
    /// full mailbox.
    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        self.tx.try_send(msg)?;
        self.signal();
        Ok(())
    }

    fn signal(&self) {
        let one: u64 = 1;
        unsafe {
            // A closed eventfd means the receiver is gone; nothing to do
            nix::libc::write(
                self.eventfd,
                &one as *const u64 as *const nix::libc::c_void,
                8,
            );
        }
    }
}

impl<T> MailboxReceiver<T> {
    /// The fd to register with the reactor's poll set.
    pub fn poll_fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }

    /// Clear the eventfd after poll reported it readable.
    pub fn clear_signal(&self) {
        let mut counter = [0u8; 8];
        unsafe {
            nix::libc::read(
                self.eventfd.as_raw_fd(),
                counter.as_mut_ptr() as *mut nix::libc::c_void,
                8,
            );
        }
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }

    /// Blocking receive, for callers that do not multiplex.
    pub fn recv(&self) -> Result<T, crossbeam_channel::RecvError> {
        self.rx.recv()
    }

    /// Drain all queued messages.
    pub fn drain(&self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(|| self.rx.try_recv().ok())
    }
}
