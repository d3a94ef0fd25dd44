//! Transport listeners and upstream dialing.

pub mod websocket;
