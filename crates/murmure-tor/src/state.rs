//! Observable transport state.
//!
//! Published through a `tokio::sync::watch` channel so subscribers always see
//! a consistent snapshot; transitions within one boot are monotonic.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TorErrorCode {
    BootstrapTimeout,
    HsPublishTimeout,
    ControlUnavailable,
    Io,
    Unknown,
}

impl TorErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BootstrapTimeout => "BOOTSTRAP_TIMEOUT",
            Self::HsPublishTimeout => "HS_PUBLISH_TIMEOUT",
            Self::ControlUnavailable => "CONTROL_UNAVAILABLE",
            Self::Io => "IO",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TorState {
    Stopped,
    Starting,
    Bootstrapping {
        progress: u8,
        tag: String,
        summary: String,
    },
    TransportReady {
        socks_host: String,
        socks_port: u16,
    },
    HiddenServicePublishing {
        onion: String,
    },
    Ready {
        onion: String,
        socks_host: String,
        socks_port: u16,
    },
    Error {
        code: TorErrorCode,
        detail: String,
        recoverable: bool,
        onion_hint: Option<String>,
    },
}

impl TorState {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Bootstrapping { .. } => "bootstrapping",
            Self::TransportReady { .. } => "transport_ready",
            Self::HiddenServicePublishing { .. } => "hs_publishing",
            Self::Ready { .. } => "ready",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// The published onion, once one is known in this state.
    pub fn onion(&self) -> Option<&str> {
        match self {
            Self::HiddenServicePublishing { onion } => Some(onion),
            Self::Ready { onion, .. } => Some(onion),
            Self::Error {
                onion_hint: Some(hint),
                ..
            } => Some(hint),
            _ => None,
        }
    }

    pub fn socks(&self) -> Option<(&str, u16)> {
        match self {
            Self::TransportReady {
                socks_host,
                socks_port,
            }
            | Self::Ready {
                socks_host,
                socks_port,
                ..
            } => Some((socks_host.as_str(), *socks_port)),
            _ => None,
        }
    }
}
