use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("configuration failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("device not ready: {0}")]
    NotReady(String),
    #[error("filter design failed: {0}")]
    Filter(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Handshake steps, used to say where a configuration exchange went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    ReadDeviceId,
    WriteChannels,
    ReadBackChannels,
}

impl std::fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HandshakeStep::ReadDeviceId => "read device id",
            HandshakeStep::WriteChannels => "write active channels",
            HandshakeStep::ReadBackChannels => "read back active channels",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("no response from CPCH, check power and connections")]
    NoResponse,
    #[error("{step}: wrong number of bytes returned (expected {expected}, received {got})")]
    WrongLength {
        step: HandshakeStep,
        expected: usize,
        got: usize,
    },
    #[error("{step}: bad response message id (expected {expected}, received {got})")]
    WrongMessageId {
        step: HandshakeStep,
        expected: u8,
        got: u8,
    },
    #[error("{step}: bad parameter id (expected {expected}, received {got})")]
    WrongParamId {
        step: HandshakeStep,
        expected: u8,
        got: u8,
    },
    #[error("{step}: bad checksum")]
    BadChecksum { step: HandshakeStep },
    #[error("configuration write rejected (flag {flag})")]
    WriteRejected { flag: u8 },
    #[error("channel mask mismatch: expected {expected:#010X}, device returned {got:#010X}")]
    ConfigMismatch { expected: u32, got: u32 },
}

pub type Result<T> = std::result::Result<T, DriverError>;
