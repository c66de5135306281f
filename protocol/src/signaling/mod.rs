//! Signaling layer: the typed wire model and the external capabilities the
//! engine consumes to reach its peers.

pub mod channel;
pub mod message;
