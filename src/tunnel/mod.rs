//! Tunnel layer
//!
//! Once a tunnel is set up, this layer moves the bytes: a bidirectional
//! splice between two connection-like endpoints with deadline and
//! cancellation support.

mod splice;

pub use splice::splice;
