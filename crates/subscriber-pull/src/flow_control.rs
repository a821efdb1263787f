use tracing::error;

/// Outstanding work at a point in time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlowControlSnapshot {
    /// Outstanding byte total.
    pub bytes: usize,

    /// Outstanding message count.
    pub messages: usize,
}

/// Bounds outstanding deliveries by count and by bytes.
///
/// Not synchronized; the owner serializes access.
#[derive(Debug)]
pub struct FlowController {
    bytes: usize,
    max_bytes: usize,
    max_messages: usize,
    messages: usize,
    violations: u64,
}

impl FlowController {
    /// Creates a controller with the given ceilings.
    #[must_use]
    pub const fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            bytes: 0,
            max_bytes,
            max_messages,
            messages: 0,
            violations: 0,
        }
    }

    /// Reserves one message slot and `size` bytes if both fit. Reserves nothing otherwise.
    pub fn try_admit(&mut self, size: usize) -> bool {
        if self.messages >= self.max_messages {
            return false;
        }

        match self.bytes.checked_add(size) {
            Some(bytes) if bytes <= self.max_bytes => {
                self.bytes = bytes;
                self.messages += 1;
                true
            }
            _ => false,
        }
    }

    /// Returns one message slot and `size` bytes.
    ///
    /// Releasing more than is outstanding clamps to zero and is counted as a violation.
    pub fn release(&mut self, size: usize) {
        if self.messages == 0 || size > self.bytes {
            self.violations += 1;
            error!(
                "flow control underflow: releasing 1 message / {} bytes with {} messages / {} bytes outstanding",
                size, self.messages, self.bytes
            );
        }

        self.messages = self.messages.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(size);
    }

    /// True if a message of `size` bytes could never be admitted, even with nothing outstanding.
    #[must_use]
    pub const fn exceeds_ceiling(&self, size: usize) -> bool {
        size > self.max_bytes
    }

    /// Message slots currently free.
    #[must_use]
    pub const fn message_headroom(&self) -> usize {
        self.max_messages.saturating_sub(self.messages)
    }

    /// Current counters.
    #[must_use]
    pub const fn snapshot(&self) -> FlowControlSnapshot {
        FlowControlSnapshot {
            bytes: self.bytes,
            messages: self.messages,
        }
    }

    /// Number of underflows seen.
    #[must_use]
    pub const fn violations(&self) -> u64 {
        self.violations
    }
}
