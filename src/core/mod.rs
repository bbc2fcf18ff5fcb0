//! # Core Protocol Components
//!
//! Addresses, the message envelope and its wire framing.
//!
//! ## Components
//! - **Address**: `{kind, id}` identity of every participant
//! - **Envelope**: `{seq, type, data}` wire unit and its typed bodies
//! - **Codec**: Tokio codec for length-delimited JSON frames
//!
//! ## Wire Format
//! ```text
//! [Length(4, big-endian)] [JSON envelope(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size is enforced before the body is buffered
//! - Envelopes that fail to parse are connection-fatal

pub mod address;
pub mod codec;
pub mod message;
