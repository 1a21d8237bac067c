//! Framing and payload schema for the reef chat relay wire protocol.
//!
//! A frame on the wire is `<decimal length>:<body>` — ASCII digits giving
//! the body's byte length, one delimiter byte, then exactly that many
//! bytes. The body is a versioned JSON [`WirePayload`], classified once at
//! the protocol boundary into a [`Directive`] so nothing downstream has to
//! re-inspect content strings.

pub mod error;
pub mod frame;
pub mod payload;

pub use error::WireError;
pub use frame::{DELIMITER, FrameCodec, MAX_FRAME_LEN};
pub use payload::{
    Directive, GetTarget, JOIN_CONTENT, KICKED_CONTENT, QUERY_CONTENT, Query, ROOMS_CONTENT,
    ROSTER_CONTENT, SCHEMA_VERSION, WirePayload, WireRoom, WireUser,
};
