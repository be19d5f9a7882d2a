//! Station announcer - plays transit station announcements in a Discord
//! voice channel on request.
//!
//! This crate provides:
//! - Station audio resolution and the route directory
//! - A single-session voice manager and the announcement state machine
//! - A minimal Discord gateway client performing the voice handshake
//! - An in-memory registry of active departures
//! - The HTTP API tying it together

pub mod config;
pub mod departures;
pub mod discord;
pub mod error;
pub mod routes;
pub mod server;
pub mod station;
pub mod voice;

pub use config::Config;
pub use error::{AnnounceError, VoiceError};
