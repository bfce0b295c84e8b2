//! Binary data encodings.
//!
//! - bincode: used for rich payloads (job descriptions, results, statistics)
//!   and for frames on the TCP peer transport.
//! - wire: the fixed little-endian layout of scheduling messages that every
//!   worker must agree on byte for byte.
pub mod bincode;
pub mod wire;
