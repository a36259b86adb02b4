//! Bounded collections shared by the handler channels and caches.

pub mod ring;

pub use ring::RingBuffer;
