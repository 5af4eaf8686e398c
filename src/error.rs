//! Error types for the daemon's three components plus the ambient
//! configuration/startup path.
//!
//! Mirrors the four error kinds of the dispatch design: a client-scoped
//! protocol violation never escapes the server's per-connection handler,
//! a reader-scoped failure is fatal to the emulation engine, and a
//! configuration failure is fatal at startup before either thread runs.

use std::io;

use thiserror::Error;

/// Failure while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        source: Box<toml::de::Error>,
    },
}

/// Failure exchanging a control command with the reader over PC/SC.
///
/// Any variant here is fatal to the emulation engine's event loop: the
/// engine tears down (best-effort `END_EMU`, release the reader) and
/// exits per spec.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("failed to establish a PC/SC context: {0}")]
    Context(pcsc::Error),

    #[error("failed to connect to reader {reader:?}: {source}")]
    Connect { reader: String, source: pcsc::Error },

    #[error("control command failed: {0}")]
    Control(pcsc::Error),

    #[error("reader returned a truncated response (expected at least 2 bytes, got {0})")]
    ShortResponse(usize),

    #[error("GET_CAPDU reported a fatal status {0:#04x} (wrong mode or wrong parameters)")]
    FatalCapduStatus(u8),

    #[error("failed to install signal handlers: {0}")]
    SignalSetup(#[from] io::Error),
}

/// A client violated the wire protocol during handshake or afterwards.
///
/// `ProtocolError` never propagates past [`crate::server::Server`]'s
/// per-connection handler; it only ever causes that one connection to be
/// torn down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error on client connection: {0}")]
    Io(#[from] io::Error),

    #[error("frame payload length {0} exceeds the 16-bit frame limit")]
    FrameTooLarge(usize),

    #[error("expected GET_API_VERSION, got {0:#04x}")]
    BadVersionRequest(u8),

    #[error("expected REGISTER_AID, got {0:#04x}")]
    BadRegistration(u8),

    #[error("registration message too short to carry an AID")]
    RegistrationTooShort,

    #[error("client requested disconnect")]
    ClientDisconnect,

    #[error("peer closed the connection")]
    PeerClosed,
}
