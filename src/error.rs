use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;
use futures::channel::mpsc::SendError;
use uuid::Uuid;

use crate::device::types::{CharacteristicId, PowerState};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (bluetooth): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("I/O error: {source}")]
    IOError { #[from] source: io::Error },

    #[error("The session stopped unexpectedly: {source}")]
    SessionClosed { #[from] source: SendError },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Peripheral {0} is not known to the adapter")]
    UnknownPeripheral(String),

    #[error("Characteristic {0} is not known to the connected peripheral")]
    UnknownCharacteristic(Uuid),

    #[error("No peripheral is connected")]
    NotConnected,

    #[error("The operation took too long")]
    Timeout,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Payload of {length} bytes is not numeric text and too short for a binary value")]
    Unrecognized { length: usize },
}

/// Everything that can go wrong inside a session. None of these leave the session; they are
/// surfaced through the snapshot as the latest error or advisory.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Bluetooth is unavailable: {0}")]
    TransportUnavailable(PowerState),

    #[error("Scanning is unavailable: {0}")]
    ScanUnavailable(String),

    #[error("Failed to connect to {device}: {reason}")]
    ConnectFailed { device: String, reason: String },

    #[error("Characteristic {characteristic} can not be used: {reason}")]
    NegotiationPartialFailure { characteristic: CharacteristicId, reason: String },

    #[error("Subscribing to {characteristic} failed ({reason}), falling back to polling")]
    SubscriptionFallback { characteristic: CharacteristicId, reason: String },

    #[error("Reading {characteristic} failed: {reason}")]
    ReadFailed { characteristic: CharacteristicId, reason: String },

    #[error("Could not decode value of {characteristic}: {source}")]
    DecodeUnrecognized { characteristic: CharacteristicId, source: DecodeError },

    #[error("Disconnected from {device}: {reason}")]
    DisconnectedWithError { device: String, reason: String },
}

impl SessionError {
    /// Advisories describe a change of strategy, streaming continues normally.
    pub fn is_advisory(&self) -> bool {
        matches!(self, SessionError::SubscriptionFallback { .. })
    }
}
