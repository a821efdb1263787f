use std::fmt;

/// Lifecycle of a message source.
///
/// `Created -> Started -> ShuttingDown -> Shutdown`. A source may also go from
/// `Created` straight to `ShuttingDown`. Nothing leaves `Shutdown`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SessionState {
    /// Constructed, no callback registered yet.
    #[default]
    Created,

    /// Callback registered, reads are served.
    Started,

    /// Shutdown requested, waiting for in-flight operations.
    ShuttingDown,

    /// Terminal.
    Shutdown,
}

impl SessionState {
    /// Returns true once the terminal state is reached.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Returns true if new deliveries may still be issued.
    #[must_use]
    pub const fn accepts_deliveries(self) -> bool {
        matches!(self, Self::Started)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::ShuttingDown => "shutting down",
            Self::Shutdown => "shutdown",
        };

        f.write_str(name)
    }
}
