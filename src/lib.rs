#![forbid(unsafe_code)]

// Watchparty library - room coordination and mediasoup voice relay for synchronized viewing

pub mod config;
pub mod error;
pub mod media;
pub mod metrics;
pub mod playlist;
pub mod room;
pub mod signaling;
pub mod store;
