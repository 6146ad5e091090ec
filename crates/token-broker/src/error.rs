use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::directory::StoreError;
use crate::types::PrincipalId;

/// Errors that stop the broker from starting or keep it from serving
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS setup error: {0}")]
    Tls(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Bootstrap failed for principal {principal}: {source}")]
    Bootstrap {
        principal: PrincipalId,
        #[source]
        source: StoreError,
    },

    #[error("Listener failed: {0}")]
    ListenerFatal(#[source] io::Error),

    #[error("Audit sink error: {0}")]
    Audit(String),
}

impl Error {
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    #[must_use]
    pub const fn is_bind(&self) -> bool {
        matches!(self, Self::Bind { .. })
    }

    #[must_use]
    pub const fn is_bootstrap(&self) -> bool {
        matches!(self, Self::Bootstrap { .. })
    }

    #[must_use]
    pub const fn is_listener_fatal(&self) -> bool {
        matches!(self, Self::ListenerFatal(_))
    }

    /// Startup errors happen before the listener reaches `Listening`.
    #[must_use]
    pub const fn is_startup(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Tls(_) | Self::Bind { .. } | Self::Bootstrap { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
