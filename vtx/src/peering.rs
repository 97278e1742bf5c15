//! One peering: the relationship between a vocket and one remote address.
//!
//! State machine:
//!
//! - created DEAD; an outgoing peering courts the peer (OHAI over UDP,
//!   reconnect over TCP) on its retry timer until raised
//! - raised ALIVE on acceptance (OHAI-OK, first datagram, TCP establish)
//! - any inbound traffic pushes `expiry` out by the peering timeout; local
//!   silence past `silent_by` triggers a keep-alive probe
//! - on expiry: an incoming peering is destroyed; an outgoing broadcast
//!   peering unfocuses back to its broadcast key; any other outgoing
//!   peering drops to DEAD and courts again
//!
//! The transport-specific half (socket address, stream handle, stream
//! codecs) lives in the `link` field; drivers instantiate `Peering<L>` with
//! their own link type.

use std::time::Instant;

use crate::frame::Message;
use crate::queue::FrameQueue;

/// The wire sequence field is four bits wide.
pub const SEQ_MASK: u8 = 0x0F;

pub struct Peering<L> {
    /// Current key in the vocket's peering table, `n.n.n.n:port` form
    /// (or the broadcast address while an unfocused broadcast peering).
    pub address: String,
    /// Broadcast key this peering was created under, if created from a
    /// wildcard connect. Focus renames `address` to the concrete responder;
    /// unfocus restores it to this key.
    pub broadcast: Option<String>,
    pub alive: bool,
    /// Created by connect (true) or by an inbound request (false).
    pub outgoing: bool,

    /// Request awaiting its reply (REQUEST routing only).
    pub request: Option<Message>,
    /// Sequence the in-flight request was sent under.
    pub request_seq: u8,
    /// Last reply sent, kept for retransmission on duplicate requests.
    pub reply: Option<Message>,
    /// Sequence the stored reply answers.
    pub reply_seq: u8,
    /// Last sequence this side sent a new request under.
    pub send_seq: u8,
    /// Last sequence received from the peer, once anything arrived.
    pub recv_seq: Option<u8>,

    /// Declared dead when now passes this with no inbound traffic.
    pub expiry: Instant,
    /// A keep-alive is due when now passes this with no outbound traffic.
    pub silent_by: Instant,
    /// Next courtship attempt (OHAI or reconnect) while dead.
    pub retry_at: Instant,
    /// Next request retransmission while one is in flight.
    pub resend_at: Instant,

    /// Outbound data the transport could not take yet; drop-oldest.
    pub pending: FrameQueue,

    /// Transport-specific state.
    pub link: L,
}

impl<L> Peering<L> {
    pub fn new(
        address: String,
        outgoing: bool,
        broadcast: Option<String>,
        pending_limit: usize,
        link: L,
        now: Instant,
    ) -> Self {
        Peering {
            address,
            broadcast,
            alive: false,
            outgoing,
            request: None,
            request_seq: 0,
            reply: None,
            reply_seq: 0,
            send_seq: 0,
            recv_seq: None,
            expiry: now,
            silent_by: now,
            retry_at: now,
            resend_at: now,
            pending: FrameQueue::new(pending_limit),
            link,
        }
    }

    /// Advance and return the 4-bit send sequence for a new request.
    pub fn next_send_seq(&mut self) -> u8 {
        self.send_seq = (self.send_seq + 1) & SEQ_MASK;
        self.send_seq
    }

    /// Inbound traffic seen: push the death timer out.
    pub fn touch_recv(&mut self, now: Instant, timeout: std::time::Duration) {
        self.expiry = now + timeout;
    }

    /// Outbound traffic sent: push the keep-alive timer out.
    pub fn touch_send(&mut self, now: Instant, keepalive: std::time::Duration) {
        self.silent_by = now + keepalive;
    }

    /// A broadcast peering currently keyed to a concrete responder.
    pub fn is_focused(&self) -> bool {
        self.broadcast
            .as_ref()
            .is_some_and(|bcast| *bcast != self.address)
    }

    /// Rekey onto the concrete responder address.
    pub fn focus(&mut self, concrete: String) {
        debug_assert!(self.broadcast.is_some());
        self.address = concrete;
    }

    /// Revert to the broadcast key to court a new responder.
    pub fn unfocus(&mut self) {
        if let Some(bcast) = &self.broadcast {
            self.address = bcast.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peering(outgoing: bool, broadcast: Option<&str>) -> Peering<()> {
        Peering::new(
            broadcast.unwrap_or("10.0.0.1:32000").to_string(),
            outgoing,
            broadcast.map(str::to_string),
            8,
            (),
            Instant::now(),
        )
    }

    #[test]
    fn test_send_seq_wraps_at_four_bits() {
        let mut p = peering(true, None);
        let seqs: Vec<u8> = (0..20).map(|_| p.next_send_seq()).collect();
        assert_eq!(seqs[0], 1);
        assert_eq!(seqs[14], 15);
        assert_eq!(seqs[15], 0);
        assert_eq!(seqs[16], 1);
    }

    #[test]
    fn test_focus_unfocus_round_trip() {
        let mut p = peering(true, Some("192.168.1.255:32000"));
        assert!(!p.is_focused());

        p.focus("192.168.1.7:32000".to_string());
        assert!(p.is_focused());
        assert_eq!(p.address, "192.168.1.7:32000");

        p.unfocus();
        assert!(!p.is_focused());
        assert_eq!(p.address, "192.168.1.255:32000");
    }

    #[test]
    fn test_timers_move_forward() {
        let mut p = peering(true, None);
        let now = Instant::now();
        p.touch_recv(now, Duration::from_secs(10));
        p.touch_send(now, Duration::from_secs(3));
        assert!(p.expiry > now);
        assert!(p.silent_by > now);
        assert!(p.expiry > p.silent_by);
    }
}
