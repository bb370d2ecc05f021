use std::time::Duration;

/// Default limit for a single frame payload, 1 MiB.
///
/// A frame declaring more than this is rejected before any of its payload is buffered.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Default limit for a reassembled message, 2 MiB.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Default time a connection may stay silent before it is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default time to wait for the peer's close frame after sending ours.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a single frame write may take.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of a WebSocket connection.
///
/// ```rust
/// use std::time::Duration;
/// use wsgate::Options;
///
/// let options = Options::default()
///     .with_max_payload_read(64 * 1024)
///     .with_idle_timeout(Duration::from_secs(30))
///     .with_utf8();
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum payload of a single incoming frame, in bytes.
    ///
    /// Default: [`MAX_PAYLOAD_READ`]
    pub max_payload_read: usize,

    /// Maximum size of a message reassembled from fragments, in bytes.
    ///
    /// Once the accumulated fragments exceed this size the connection is closed with
    /// status 1009.
    ///
    /// Default: [`MAX_MESSAGE_SIZE`]
    pub max_message_size: usize,

    /// How long the read loop waits for the next frame before closing the connection with
    /// status 1001. `None` waits forever.
    ///
    /// Default: [`IDLE_TIMEOUT`]
    pub idle_timeout: Option<Duration>,

    /// How long to wait for the peer's close frame after a locally initiated close.
    ///
    /// Default: [`CLOSE_TIMEOUT`]
    pub close_timeout: Duration,

    /// Deadline for writing one frame to the stream. `None` disables it.
    ///
    /// Default: [`WRITE_TIMEOUT`]
    pub write_timeout: Option<Duration>,

    /// Validate that incoming text messages are UTF-8, closing with status 1007 otherwise.
    ///
    /// Default: `false`
    pub check_utf8: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: MAX_PAYLOAD_READ,
            max_message_size: MAX_MESSAGE_SIZE,
            idle_timeout: Some(IDLE_TIMEOUT),
            close_timeout: CLOSE_TIMEOUT,
            write_timeout: Some(WRITE_TIMEOUT),
            check_utf8: false,
        }
    }
}

impl Options {
    /// Sets the maximum payload accepted for a single frame.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: size,
            ..self
        }
    }

    /// Sets the maximum size of a reassembled message.
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: size,
            ..self
        }
    }

    pub fn with_idle_timeout(self, timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(timeout),
            ..self
        }
    }

    /// Lets a connection stay silent indefinitely.
    pub fn without_idle_timeout(self) -> Self {
        Self {
            idle_timeout: None,
            ..self
        }
    }

    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: timeout,
            ..self
        }
    }

    pub fn with_write_timeout(self, timeout: Duration) -> Self {
        Self {
            write_timeout: Some(timeout),
            ..self
        }
    }

    pub fn without_write_timeout(self) -> Self {
        Self {
            write_timeout: None,
            ..self
        }
    }

    /// Enables UTF-8 validation of incoming text messages.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }
}
