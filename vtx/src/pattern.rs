//! Socket patterns and their routing profiles.

/// Ceiling on peerings for the patterns that allow "many".
pub const MAX_PEERINGS: usize = 1024;

/// Messaging pattern carried by a vocket. The numeric codes are stable;
/// they travel as ascii integers on the control mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    Pair = 0,
    Pub = 1,
    Sub = 2,
    Req = 3,
    Rep = 4,
    Dealer = 5,
    Router = 6,
    Pull = 7,
    Push = 8,
}

/// How outbound messages pick their peering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Sending is not allowed; the message is dropped with a warning.
    None,
    /// Round-robin, one request in flight per peering.
    Request,
    /// To the peering the last inbound request came from.
    Reply,
    /// Round-robin, with reply replay bookkeeping.
    Dealer,
    /// First frame names the peering as `scheme://host:port`.
    Router,
    /// To every live peering.
    Publish,
    /// To the single peering.
    Single,
}

/// Per-pattern routing parameters.
#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub routing: Routing,
    /// Whether inbound payloads are accepted and delivered.
    pub accepts_input: bool,
    /// Live peerings required before the app mailbox is polled.
    pub min_peerings: usize,
    pub max_peerings: usize,
}

impl Pattern {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Pattern> {
        match code {
            0 => Some(Pattern::Pair),
            1 => Some(Pattern::Pub),
            2 => Some(Pattern::Sub),
            3 => Some(Pattern::Req),
            4 => Some(Pattern::Rep),
            5 => Some(Pattern::Dealer),
            6 => Some(Pattern::Router),
            7 => Some(Pattern::Pull),
            8 => Some(Pattern::Push),
            _ => None,
        }
    }

    pub fn profile(self) -> Profile {
        match self {
            Pattern::Req => Profile {
                routing: Routing::Request,
                accepts_input: true,
                min_peerings: 1,
                max_peerings: MAX_PEERINGS,
            },
            Pattern::Rep => Profile {
                routing: Routing::Reply,
                accepts_input: true,
                min_peerings: 1,
                max_peerings: MAX_PEERINGS,
            },
            Pattern::Router => Profile {
                routing: Routing::Router,
                accepts_input: true,
                min_peerings: 0,
                max_peerings: MAX_PEERINGS,
            },
            Pattern::Dealer => Profile {
                routing: Routing::Dealer,
                accepts_input: true,
                min_peerings: 1,
                max_peerings: MAX_PEERINGS,
            },
            Pattern::Pub => Profile {
                routing: Routing::Publish,
                accepts_input: false,
                min_peerings: 0,
                max_peerings: MAX_PEERINGS,
            },
            Pattern::Sub => Profile {
                routing: Routing::None,
                accepts_input: true,
                min_peerings: 1,
                max_peerings: MAX_PEERINGS,
            },
            Pattern::Push => Profile {
                routing: Routing::Dealer,
                accepts_input: false,
                min_peerings: 1,
                max_peerings: MAX_PEERINGS,
            },
            Pattern::Pull => Profile {
                routing: Routing::None,
                accepts_input: true,
                min_peerings: 1,
                max_peerings: MAX_PEERINGS,
            },
            Pattern::Pair => Profile {
                routing: Routing::Single,
                accepts_input: true,
                min_peerings: 1,
                max_peerings: 1,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for pattern in [
            Pattern::Pair,
            Pattern::Pub,
            Pattern::Sub,
            Pattern::Req,
            Pattern::Rep,
            Pattern::Dealer,
            Pattern::Router,
            Pattern::Pull,
            Pattern::Push,
        ] {
            assert_eq!(Pattern::from_code(pattern.code()), Some(pattern));
        }
        assert_eq!(Pattern::from_code(99), None);
    }

    #[test]
    fn test_pair_is_exclusive() {
        let profile = Pattern::Pair.profile();
        assert_eq!(profile.max_peerings, 1);
        assert_eq!(profile.routing, Routing::Single);
    }

    #[test]
    fn test_send_only_patterns_refuse_input() {
        assert!(!Pattern::Pub.profile().accepts_input);
        assert!(!Pattern::Push.profile().accepts_input);
        assert!(Pattern::Sub.profile().accepts_input);
    }
}
