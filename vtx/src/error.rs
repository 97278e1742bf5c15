//! Error types shared across the VTX front, the codec and the drivers.

use thiserror::Error;

/// Numeric status codes used on the control-mailbox reply.
///
/// `0` is success; everything else maps onto one `VtxError` variant so that
/// the synchronous bind/connect round trip can carry a single integer.
pub mod status {
    pub const OK: i32 = 0;
    pub const NOT_UNIQUE: i32 = 1;
    pub const NO_SUCH_PROTOCOL: i32 = 2;
    pub const INVALID_ENDPOINT: i32 = 3;
    pub const SCHEME_MISMATCH: i32 = 4;
    pub const TOO_MANY_PEERINGS: i32 = 5;
    pub const NO_SUCH_META: i32 = 6;
    pub const INTERNAL: i32 = 7;
}

#[derive(Debug, Error)]
pub enum VtxError {
    /// A driver is already registered for this scheme.
    #[error("scheme already registered: {0}")]
    NotUnique(String),

    /// No driver is registered for the scheme of an endpoint.
    #[error("no driver for scheme: {0}")]
    NoSuchProtocol(String),

    /// The endpoint string is not of the form `scheme://host:port`.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A vocket is pinned to one scheme by its first bind/connect.
    #[error("vocket already uses scheme '{bound}', cannot use '{requested}'")]
    SchemeMismatch { bound: String, requested: String },

    /// Connect beyond the pattern's peering limit.
    #[error("too many peerings (limit {0})")]
    TooManyPeerings(usize),

    /// Unknown metadata name passed to getmeta.
    #[error("no such metadata: {0}")]
    NoSuchMeta(String),

    /// Codec store has no room for the next put.
    #[error("codec full")]
    Full,

    /// Codec store holds no complete frame.
    #[error("codec empty")]
    Empty,

    /// Malformed framing in the codec store or on the wire.
    #[error("corrupt frame")]
    Corrupt,

    /// A timed receive elapsed without a message.
    #[error("timed out")]
    Timeout,

    /// The driver thread is gone; its mailboxes are disconnected.
    #[error("driver unavailable")]
    DriverGone,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl VtxError {
    /// Status code carried on the control-mailbox reply.
    pub fn status(&self) -> i32 {
        match self {
            VtxError::NotUnique(_) => status::NOT_UNIQUE,
            VtxError::NoSuchProtocol(_) => status::NO_SUCH_PROTOCOL,
            VtxError::InvalidEndpoint(_) => status::INVALID_ENDPOINT,
            VtxError::SchemeMismatch { .. } => status::SCHEME_MISMATCH,
            VtxError::TooManyPeerings(_) => status::TOO_MANY_PEERINGS,
            VtxError::NoSuchMeta(_) => status::NO_SUCH_META,
            _ => status::INTERNAL,
        }
    }

    /// Rebuild an error from a control reply status, with `detail` naming
    /// the address or metadata the request carried.
    pub fn from_status(code: i32, detail: &str) -> Option<VtxError> {
        match code {
            status::OK => None,
            status::NOT_UNIQUE => Some(VtxError::NotUnique(detail.to_string())),
            status::NO_SUCH_PROTOCOL => Some(VtxError::NoSuchProtocol(detail.to_string())),
            status::INVALID_ENDPOINT => Some(VtxError::InvalidEndpoint(detail.to_string())),
            status::SCHEME_MISMATCH => Some(VtxError::SchemeMismatch {
                bound: String::new(),
                requested: detail.to_string(),
            }),
            status::TOO_MANY_PEERINGS => Some(VtxError::TooManyPeerings(0)),
            status::NO_SUCH_META => Some(VtxError::NoSuchMeta(detail.to_string())),
            _ => Some(VtxError::DriverGone),
        }
    }
}
