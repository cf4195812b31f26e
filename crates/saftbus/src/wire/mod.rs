//! Wire layer: envelope types, framing codec, socket plumbing.

pub mod codec;
pub mod protocol;
pub mod transport;
