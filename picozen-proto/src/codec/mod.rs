//! Pure encode/decode entry points over read and write cursors.

pub mod network;
pub mod transport;

pub use network::{decode_network_message, encode_network_message};
pub use transport::{
    decode_scouting_message, decode_transport_message, encode_scouting_message,
    encode_transport_message,
};
