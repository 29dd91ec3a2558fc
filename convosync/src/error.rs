//! Error taxonomy shared by every component.
//!
//! Each module has its own `thiserror` enum; all of them map onto the
//! closed [`ErrorKind`] set through a `kind()` method so the presentation
//! layer can choose a message with one exhaustive match.

use std::fmt;

/// Closed classification of everything that can go wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The backend could not be reached or the connection dropped. Retrying
    /// may succeed.
    TransientNetwork,
    /// Data arrived out of order and is being repaired by a backfill.
    OutOfOrder,
    /// The backend refused the request; retrying unchanged will not help.
    PermanentRejection,
    /// Encrypted content could not be opened or sealed.
    DecryptionFailure,
    /// Required configuration is missing or malformed.
    ConfigurationAbsent,
    /// The persistent key-value store failed.
    Storage,
    /// The caller supplied invalid input.
    InvalidInput,
}

impl ErrorKind {
    /// Returns `true` for errors worth retrying automatically.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::TransientNetwork | Self::OutOfOrder)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransientNetwork => "transient-network",
            Self::OutOfOrder => "out-of-order",
            Self::PermanentRejection => "permanent-rejection",
            Self::DecryptionFailure => "decryption-failure",
            Self::ConfigurationAbsent => "configuration-absent",
            Self::Storage => "storage",
            Self::InvalidInput => "invalid-input",
        };
        f.write_str(name)
    }
}

/// User-facing text for an error kind.
#[must_use]
pub const fn user_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::TransientNetwork => "Connection problem. We'll keep trying.",
        ErrorKind::OutOfOrder => "Catching up on missed messages\u{2026}",
        ErrorKind::PermanentRejection => "The message could not be sent.",
        ErrorKind::DecryptionFailure => "This message could not be decrypted.",
        ErrorKind::ConfigurationAbsent => "The app is not configured correctly.",
        ErrorKind::Storage => "Local storage is unavailable.",
        ErrorKind::InvalidInput => "Please check your input and try again.",
    }
}
