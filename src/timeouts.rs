//! Typed holder for connect/read/write deadlines.

use std::time::Duration;

/// Connect/read/write deadlines for a single connection or exchange.
///
/// Each leg is independently optional; `None` means "no limit". Per-I/O-operation
/// timeouts (read, write) are not cumulative across a whole request/response —
/// every individual `read`/`write` call gets the full budget again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeouts {
    connect: Option<Duration>,
    read: Option<Duration>,
    write: Option<Duration>,
}

/// `#[derive(Default)]` above yields all-`None` (unbounded); `five_seconds()`
/// below is the separate, explicit five-second-per-leg default callers
/// historically expect from an HTTP client.
const DEFAULT_SECS: u64 = 5;

impl Timeouts {
    /// No limit on any leg.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            connect: None,
            read: None,
            write: None,
        }
    }

    /// The same duration applied to connect, read, and write.
    #[must_use]
    pub const fn all(duration: Duration) -> Self {
        Self {
            connect: Some(duration),
            read: Some(duration),
            write: Some(duration),
        }
    }

    /// Independent deadlines for each leg.
    #[must_use]
    pub const fn new(
        connect: Option<Duration>,
        read: Option<Duration>,
        write: Option<Duration>,
    ) -> Self {
        Self {
            connect,
            read,
            write,
        }
    }

    /// The client's historical default: five seconds on every leg.
    #[must_use]
    pub const fn five_seconds() -> Self {
        Self::all(Duration::from_secs(DEFAULT_SECS))
    }

    #[must_use]
    pub const fn connect(self) -> Option<Duration> {
        self.connect
    }

    #[must_use]
    pub const fn read(self) -> Option<Duration> {
        self.read
    }

    #[must_use]
    pub const fn write(self) -> Option<Duration> {
        self.write
    }

    #[must_use]
    pub const fn with_connect(mut self, connect: Option<Duration>) -> Self {
        self.connect = connect;
        self
    }

    #[must_use]
    pub const fn with_read(mut self, read: Option<Duration>) -> Self {
        self.read = read;
        self
    }

    #[must_use]
    pub const fn with_write(mut self, write: Option<Duration>) -> Self {
        self.write = write;
        self
    }
}

impl From<Duration> for Timeouts {
    fn from(d: Duration) -> Self {
        Self::all(d)
    }
}

impl From<(Duration, Duration, Duration)> for Timeouts {
    fn from((connect, read, write): (Duration, Duration, Duration)) -> Self {
        Self::new(Some(connect), Some(read), Some(write))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_applies_to_all_three_legs() {
        let t = Timeouts::from(Duration::from_secs(2));
        assert_eq!(t.connect(), Some(Duration::from_secs(2)));
        assert_eq!(t.read(), Some(Duration::from_secs(2)));
        assert_eq!(t.write(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn triple_sets_each_leg_independently() {
        let t = Timeouts::from((
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(3),
        ));
        assert_eq!(t.connect(), Some(Duration::from_secs(1)));
        assert_eq!(t.read(), Some(Duration::from_secs(2)));
        assert_eq!(t.write(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn none_means_unbounded_on_every_leg() {
        let t = Timeouts::none();
        assert_eq!(t.connect(), None);
        assert_eq!(t.read(), None);
        assert_eq!(t.write(), None);
    }

    #[test]
    fn from_another_timeouts_is_identity() {
        let original = Timeouts::new(Some(Duration::from_secs(1)), None, Some(Duration::from_secs(3)));
        let copy = original;
        assert_eq!(copy, original);
    }

    #[test]
    fn builder_methods_override_individual_legs() {
        let t = Timeouts::five_seconds().with_read(None);
        assert_eq!(t.connect(), Some(Duration::from_secs(5)));
        assert_eq!(t.read(), None);
        assert_eq!(t.write(), Some(Duration::from_secs(5)));
    }
}
