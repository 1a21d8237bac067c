//! Wire protocol error taxonomy.

/// Anything that can go wrong between raw bytes and a classified directive.
///
/// Framing errors (`BadLength`, `LengthOverflow`, `Oversized`) are fatal for
/// the connection that produced them; payload errors are dropped per-frame by
/// the server loop.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("length prefix contains non-digit byte {0:#04x}")]
    BadLength(u8),

    #[error("length prefix does not fit in usize")]
    LengthOverflow,

    #[error("declared frame length {len} exceeds maximum {max}")]
    Oversized { len: usize, max: usize },

    #[error("malformed payload: {0}")]
    BadPayload(#[from] serde_json::Error),

    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u8),

    #[error("payload is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unrecognized query directive `{0}`")]
    UnknownQuery(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
