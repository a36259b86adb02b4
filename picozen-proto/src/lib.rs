//! Picozen wire codec
//!
//! Sans-IO encode/decode for the whole protocol surface:
//! - VLE integers and wire cursors (`reader`)
//! - Extension framework (`ext`)
//! - Transport and scouting messages (`transport`, `codec::transport`)
//! - Network messages and declarations (`network`, `codec::network`)
//! - Stream framing with the 16-bit length prefix (`framing`)
//!
//! No I/O happens here; the transport layer owns buffers and links.

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
pub mod codec;
pub mod error;
pub mod ext;
pub mod framing;
pub mod network;
pub mod reader;
pub mod transport;

pub use error::{CodecError, Result};
