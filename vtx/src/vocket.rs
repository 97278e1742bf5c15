//! The vocket: one virtual socket with pattern semantics.
//!
//! A vocket owns a binding table and a peering table, an ordered peering
//! list for stable enumeration, and the live-peering list that doubles as
//! the round-robin rotation queue. The routing engine picks target
//! peerings for outbound messages per the pattern's rule and does the
//! pattern bookkeeping (in-flight request, stored reply, reply-to) in the
//! same step; drivers only perform the transport send.
//!
//! The generic parameters carry the transport halves: `L` is the per
//! peering link state, `B` the per-binding state.

use std::collections::{HashMap, VecDeque};

use crossbeam_channel::Sender;
use tracing::debug;

use crate::endpoint;
use crate::error::VtxError;
use crate::frame::{Frame, Message};
use crate::mailbox::MailboxReceiver;
use crate::pattern::{Pattern, Profile, Routing};
use crate::peering::Peering;

/// Driver-side endpoints of a vocket's application mailbox.
pub struct VocketPipe {
    /// Messages the application wants sent.
    pub from_app: MailboxReceiver<Message>,
    /// Messages to deliver to the application.
    pub to_app: Sender<Message>,
}

/// One local listen endpoint on a vocket.
pub struct Binding<B> {
    pub address: String,
    pub link: B,
}

/// Crossing of the min-live threshold caused by a raise or lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// The vocket just became ready: start polling its app mailbox.
    Opened,
    /// The vocket just dropped below minimum: stop polling.
    Closed,
    Unchanged,
}

/// Outcome of routing one outbound message.
pub enum RoutePlan {
    /// Send `msg` to each target peering. `kind` tells the driver which
    /// sequence slot applies (request vs reply bookkeeping already done).
    Send {
        targets: Vec<String>,
        msg: Message,
        kind: Routing,
    },
    /// Nothing to send; `misuse` distinguishes pattern misuse (logged as
    /// error) from routine drops (logged as warning).
    Drop {
        reason: &'static str,
        misuse: bool,
    },
}

pub struct Vocket<L, B> {
    pub name: String,
    pub scheme: String,
    pub pattern: Pattern,
    pub profile: Profile,
    pub bindings: HashMap<String, Binding<B>>,
    peerings: HashMap<String, Peering<L>>,
    /// Peering keys in creation order.
    peering_list: Vec<String>,
    /// Live peering keys; rotated front-to-back by round-robin routing.
    live: VecDeque<String>,
    /// Peering the next REPLY-routed message goes to.
    pub reply_to: Option<String>,
    /// Origin address of the last delivered inbound message.
    pub last_sender: Option<String>,
    pub pipe: Option<VocketPipe>,
}

impl<L, B> Vocket<L, B> {
    pub fn new(name: String, scheme: String, pattern: Pattern, pipe: Option<VocketPipe>) -> Self {
        Vocket {
            name,
            scheme,
            pattern,
            profile: pattern.profile(),
            bindings: HashMap::new(),
            peerings: HashMap::new(),
            peering_list: Vec::new(),
            live: VecDeque::new(),
            reply_to: None,
            last_sender: None,
            pipe,
        }
    }

    pub fn peering(&self, key: &str) -> Option<&Peering<L>> {
        self.peerings.get(key)
    }

    pub fn peering_mut(&mut self, key: &str) -> Option<&mut Peering<L>> {
        self.peerings.get_mut(key)
    }

    pub fn peering_count(&self) -> usize {
        self.peerings.len()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Peering keys in creation order, cloned so callers can mutate while
    /// walking them.
    pub fn peering_keys(&self) -> Vec<String> {
        self.peering_list.clone()
    }

    /// Room for one more peering?
    pub fn peering_capacity_left(&self) -> bool {
        self.peerings.len() < self.profile.max_peerings
    }

    /// Add a new peering under its address key.
    pub fn insert_peering(&mut self, peering: Peering<L>) -> Result<&mut Peering<L>, VtxError> {
        if !self.peering_capacity_left() {
            return Err(VtxError::TooManyPeerings(self.profile.max_peerings));
        }
        let key = peering.address.clone();
        debug_assert!(!self.peerings.contains_key(&key), "duplicate peering key");
        self.peering_list.push(key.clone());
        debug!(vocket = %self.name, peer = %key, "create peering");
        Ok(self.peerings.entry(key).or_insert(peering))
    }

    /// Drop a peering entirely, lowering it first.
    pub fn remove_peering(&mut self, key: &str) -> (Option<Peering<L>>, Gate) {
        let gate = self.lower_peering(key);
        let peering = self.peerings.remove(key);
        if peering.is_some() {
            self.peering_list.retain(|k| k != key);
            debug!(vocket = %self.name, peer = %key, "delete peering");
        }
        if self.reply_to.as_deref() == Some(key) {
            self.reply_to = None;
        }
        (peering, gate)
    }

    /// Rename a peering's table key (broadcast focus/unfocus).
    pub fn rekey_peering(&mut self, old: &str, new: String) {
        let Some(mut peering) = self.peerings.remove(old) else {
            return;
        };
        peering.address = new.clone();
        for slot in &mut self.peering_list {
            if slot == old {
                *slot = new.clone();
            }
        }
        for slot in &mut self.live {
            if slot == old {
                *slot = new.clone();
            }
        }
        if self.reply_to.as_deref() == Some(old) {
            self.reply_to = Some(new.clone());
        }
        self.peerings.insert(new, peering);
    }

    /// Mark a peering alive and admit it to the live list.
    pub fn raise_peering(&mut self, key: &str) -> Gate {
        let Some(peering) = self.peerings.get_mut(key) else {
            return Gate::Unchanged;
        };
        if peering.alive {
            return Gate::Unchanged;
        }
        peering.alive = true;
        self.live.push_back(key.to_string());
        debug!(vocket = %self.name, peer = %key, "bring up peering");
        if self.profile.min_peerings > 0 && self.live.len() == self.profile.min_peerings {
            Gate::Opened
        } else {
            Gate::Unchanged
        }
    }

    /// Mark a peering dead and expel it from the live list.
    pub fn lower_peering(&mut self, key: &str) -> Gate {
        let Some(peering) = self.peerings.get_mut(key) else {
            return Gate::Unchanged;
        };
        if !peering.alive {
            return Gate::Unchanged;
        }
        peering.alive = false;
        self.live.retain(|k| k != key);
        debug!(vocket = %self.name, peer = %key, "take down peering");
        if self.profile.min_peerings > 0 && self.live.len() + 1 == self.profile.min_peerings {
            Gate::Closed
        } else {
            Gate::Unchanged
        }
    }

    /// The app mailbox is polled only while enough peerings are live.
    pub fn gated_in(&self) -> bool {
        self.live.len() >= self.profile.min_peerings
    }

    /// Next live peering in rotation: pop front, requeue at the back.
    fn next_live(&mut self) -> Option<String> {
        while let Some(key) = self.live.pop_front() {
            if self.peerings.get(&key).is_some_and(|p| p.alive) {
                self.live.push_back(key.clone());
                return Some(key);
            }
        }
        None
    }

    /// Route one outbound message per the pattern rule, doing the pattern
    /// bookkeeping (request/reply slots, reply-to) on the way.
    pub fn route_outgoing(&mut self, msg: Message) -> RoutePlan {
        match self.profile.routing {
            Routing::None => RoutePlan::Drop {
                reason: "send not allowed on this pattern",
                misuse: false,
            },
            Routing::Request => {
                let Some(key) = self.next_live() else {
                    return RoutePlan::Drop {
                        reason: "no live peerings",
                        misuse: false,
                    };
                };
                let peering = self.peerings.get_mut(&key).expect("live key resolves");
                if peering.request.is_some() {
                    return RoutePlan::Drop {
                        reason: "send without recv on a request socket",
                        misuse: true,
                    };
                }
                peering.request_seq = peering.next_send_seq();
                peering.request = Some(msg.clone());
                RoutePlan::Send {
                    targets: vec![key],
                    msg,
                    kind: Routing::Request,
                }
            }
            Routing::Reply => {
                let Some(key) = self.reply_to.take() else {
                    return RoutePlan::Drop {
                        reason: "reply without a pending request",
                        misuse: true,
                    };
                };
                let Some(peering) = self.peerings.get_mut(&key) else {
                    return RoutePlan::Drop {
                        reason: "reply peering is gone",
                        misuse: false,
                    };
                };
                peering.reply_seq = peering.recv_seq.unwrap_or(0);
                peering.reply = Some(msg.clone());
                RoutePlan::Send {
                    targets: vec![key],
                    msg,
                    kind: Routing::Reply,
                }
            }
            Routing::Dealer => {
                let Some(key) = self.next_live() else {
                    return RoutePlan::Drop {
                        reason: "no live peerings",
                        misuse: false,
                    };
                };
                let peering = self.peerings.get_mut(&key).expect("live key resolves");
                // Keep the reply slot current so a re-received request is
                // answered by replay rather than dropped
                peering.reply_seq = peering.recv_seq.unwrap_or(0);
                peering.reply = Some(msg.clone());
                RoutePlan::Send {
                    targets: vec![key],
                    msg,
                    kind: Routing::Dealer,
                }
            }
            Routing::Router => {
                let mut msg = msg;
                if msg.len() < 2 {
                    return RoutePlan::Drop {
                        reason: "routed message needs an address frame and a payload",
                        misuse: true,
                    };
                }
                let addr_frame = msg.remove(0);
                let Ok(text) = std::str::from_utf8(&addr_frame.data) else {
                    return RoutePlan::Drop {
                        reason: "address frame is not text",
                        misuse: true,
                    };
                };
                let mut parts = text.splitn(2, "://");
                let (scheme, key) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
                if scheme != self.scheme || key.is_empty() {
                    return RoutePlan::Drop {
                        reason: "invalid address frame",
                        misuse: true,
                    };
                }
                let Some(peering) = self.peerings.get_mut(key).filter(|p| p.alive) else {
                    return RoutePlan::Drop {
                        reason: "no route to peer",
                        misuse: false,
                    };
                };
                peering.reply_seq = peering.recv_seq.unwrap_or(0);
                peering.reply = Some(msg.clone());
                RoutePlan::Send {
                    targets: vec![key.to_string()],
                    msg,
                    kind: Routing::Router,
                }
            }
            Routing::Publish => RoutePlan::Send {
                targets: self.live.iter().cloned().collect(),
                msg,
                kind: Routing::Publish,
            },
            Routing::Single => {
                let Some(key) = self.peering_list.first().cloned() else {
                    return RoutePlan::Drop {
                        reason: "no peering on exclusive pair",
                        misuse: true,
                    };
                };
                if !self.peerings.get(&key).is_some_and(|p| p.alive) {
                    return RoutePlan::Drop {
                        reason: "pair peering is not alive",
                        misuse: true,
                    };
                }
                RoutePlan::Send {
                    targets: vec![key],
                    msg,
                    kind: Routing::Single,
                }
            }
        }
    }

    /// Pattern bookkeeping for an inbound message from peering `key`.
    ///
    /// Returns the message to hand to the application (ROUTER prepends the
    /// sender address frame), or None when the pattern refuses input.
    pub fn deliver_inbound(&mut self, key: &str, mut msg: Message) -> Option<Message> {
        if !self.profile.accepts_input {
            return None;
        }
        self.last_sender = Some(key.to_string());
        if self.profile.routing == Routing::Reply {
            self.reply_to = Some(key.to_string());
        }
        if self.profile.routing == Routing::Router {
            let address = format!("{}://{}", self.scheme, key);
            msg.insert(0, Frame::new(address.into_bytes(), true));
        }
        Some(msg)
    }

    /// Vocket metadata for the application.
    pub fn getmeta(&self, name: &str) -> Result<String, VtxError> {
        match name {
            "sender" => Ok(self
                .last_sender
                .as_deref()
                .map(endpoint::host_part)
                .unwrap_or_default()
                .to_string()),
            _ => Err(VtxError::NoSuchMeta(name.to_string())),
        }
    }
}
