//! Crate-level error fold (§7). Each component raises its own `thiserror`
//! enum; `CoreError` wraps them for callers who want one type, and
//! `ErrorKind` gives the stable classification from §7's table for callers
//! who want to match on policy rather than on which component raised it.
//!
//! Grounded in the donor `lib.rs`'s `SyncFfiError` fold over per-module
//! error enums.

use thiserror::Error;

use crate::channel::ChannelError;
use crate::circuit::CircuitError;
use crate::crypto::CryptoError;
use crate::registry::RegistryError;
use crate::signaling::SignalingError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Circuit(#[from] CircuitError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// The policy-relevant classification from §7, independent of which
/// component happened to raise the underlying error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SignalingUnavailable,
    NotConnected,
    UnwrapFailed,
    AuthTagInvalid,
    HopEstablishFailed,
    InsufficientPeers,
    CircuitNotReady,
    CircuitClosed,
    Timeout,
    Other,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Crypto(CryptoError::UnwrapFailed) => ErrorKind::UnwrapFailed,
            CoreError::Crypto(CryptoError::AuthTagInvalid) => ErrorKind::AuthTagInvalid,
            CoreError::Crypto(_) => ErrorKind::Other,

            CoreError::Signaling(SignalingError::SignalingUnavailable) => ErrorKind::SignalingUnavailable,
            CoreError::Signaling(SignalingError::NotConnected) => ErrorKind::NotConnected,
            CoreError::Signaling(SignalingError::Timeout) => ErrorKind::Timeout,

            CoreError::Registry(RegistryError::ValidationTimeout) => ErrorKind::Timeout,
            CoreError::Registry(RegistryError::InsufficientPeers) => ErrorKind::InsufficientPeers,
            CoreError::Registry(RegistryError::Signaling(inner)) => signaling_kind(inner),
            CoreError::Registry(RegistryError::UnknownPeer) => ErrorKind::Other,

            CoreError::Circuit(CircuitError::InsufficientPeers { .. }) => ErrorKind::InsufficientPeers,
            CoreError::Circuit(CircuitError::HopTimeout { .. }) => ErrorKind::HopEstablishFailed,
            CoreError::Circuit(CircuitError::LinkFailed { .. }) => ErrorKind::HopEstablishFailed,
            CoreError::Circuit(CircuitError::InvalidState) => ErrorKind::CircuitNotReady,
            CoreError::Circuit(CircuitError::UnknownCircuit) => ErrorKind::CircuitNotReady,
            CoreError::Circuit(CircuitError::CircuitClosed) => ErrorKind::CircuitClosed,
            CoreError::Circuit(CircuitError::Crypto(_)) => ErrorKind::Other,
            CoreError::Circuit(CircuitError::Signaling(inner)) => signaling_kind(inner),

            CoreError::Channel(ChannelError::NotOpen) => ErrorKind::CircuitNotReady,
            CoreError::Channel(ChannelError::CircuitClosed) => ErrorKind::CircuitClosed,
        }
    }
}

fn signaling_kind(err: &SignalingError) -> ErrorKind {
    match err {
        SignalingError::SignalingUnavailable => ErrorKind::SignalingUnavailable,
        SignalingError::NotConnected => ErrorKind::NotConnected,
        SignalingError::Timeout => ErrorKind::Timeout,
    }
}
