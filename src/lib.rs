//! trafmask: UDP cover traffic with realistic protocol fingerprints
//!
//! The [`obfuscation`] module holds the shaping engine: statistical models
//! for packet sizes, gaps and payload entropy, and the stream generator that
//! paces them under a rate budget. [`server`] and [`client`] drive that
//! stream over UDP sockets.

pub mod client;
pub mod config;
pub mod legacy;
pub mod logging;
pub mod net;
pub mod obfuscation;
pub mod profile;
pub mod protocol;
pub mod server;
