//! Connection and wait-operation configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use browser_session::ConnectionOptions;
//!
//! let options = ConnectionOptions::new()
//!     .with_call_timeout(Duration::from_secs(10))
//!     .with_inbound_delay(Duration::from_millis(5));
//! ```
//!
//! # Environment
//!
//! | Variable | Field |
//! |----------|-------|
//! | `BROWSER_SESSION_CONNECT_TIMEOUT_MS` | `connect_timeout` |
//! | `BROWSER_SESSION_CALL_TIMEOUT_MS` | `call_timeout` |
//! | `BROWSER_SESSION_INBOUND_DELAY_MS` | `inbound_delay` |

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default transport connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default polling interval for wait-operations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default event broadcast capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default utility script evaluated for [`Realm::utility`](crate::Realm::utility).
pub const DEFAULT_UTILITY_SCRIPT: &str = "(() => ({ \
    query: (root, selector) => (root || document).querySelector(selector), \
    queryAll: (root, selector) => Array.from((root || document).querySelectorAll(selector)), \
    text: (node) => node ? node.textContent : null \
}))()";

const ENV_CONNECT_TIMEOUT: &str = "BROWSER_SESSION_CONNECT_TIMEOUT_MS";
const ENV_CALL_TIMEOUT: &str = "BROWSER_SESSION_CALL_TIMEOUT_MS";
const ENV_INBOUND_DELAY: &str = "BROWSER_SESSION_INBOUND_DELAY_MS";

// ============================================================================
// ConnectionOptions
// ============================================================================

/// Connection-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Transport connect / accept timeout.
    pub connect_timeout: Duration,

    /// Timeout used by `send_and_wait` without an explicit timeout.
    pub call_timeout: Duration,

    /// Artificial delay applied to every inbound message before dispatch.
    pub inbound_delay: Duration,

    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,

    /// Default polling interval for wait-operations.
    pub poll_interval: Duration,

    /// Expression producing the cached utility object.
    pub utility_script: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionOptions {
    /// Creates options with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            inbound_delay: Duration::ZERO,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            utility_script: DEFAULT_UTILITY_SCRIPT.to_string(),
        }
    }

    /// Creates default options overlaid with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set but not a valid
    /// number of milliseconds.
    pub fn from_env() -> Result<Self> {
        Self::new().with_overrides(|key| std::env::var(key).ok())
    }

    /// Overlays overrides resolved through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on an unparsable value.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(ms) = parse_millis(ENV_CONNECT_TIMEOUT, lookup(ENV_CONNECT_TIMEOUT))? {
            self.connect_timeout = ms;
        }
        if let Some(ms) = parse_millis(ENV_CALL_TIMEOUT, lookup(ENV_CALL_TIMEOUT))? {
            self.call_timeout = ms;
        }
        if let Some(ms) = parse_millis(ENV_INBOUND_DELAY, lookup(ENV_INBOUND_DELAY))? {
            self.inbound_delay = ms;
        }
        self.validate()?;
        Ok(self)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ConnectionOptions {
    /// Sets the connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the default per-call timeout.
    #[inline]
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Delays every inbound message (testing / throttling).
    #[inline]
    #[must_use]
    pub fn with_inbound_delay(mut self, delay: Duration) -> Self {
        self.inbound_delay = delay;
        self
    }

    /// Sets the event broadcast capacity.
    #[inline]
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets the default wait-operation polling interval.
    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replaces the utility script.
    #[inline]
    #[must_use]
    pub fn with_utility_script(mut self, script: impl Into<String>) -> Self {
        self.utility_script = script.into();
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ConnectionOptions {
    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(Error::config("call_timeout must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect_timeout must be greater than zero"));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("event_capacity must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll_interval must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_millis(key: &str, raw: Option<String>) -> Result<Option<Duration>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|e| Error::config(format!("{key}='{raw}' is not a millisecond count: {e}")))
}

// ============================================================================
// WaitOptions
// ============================================================================

/// Settings for one wait-operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// Overall deadline (`None` = wait until resolved, cancelled or destroyed).
    pub timeout: Option<Duration>,
    /// Polling interval (`None` = connection default).
    pub interval: Option<Duration>,
}

impl WaitOptions {
    /// Creates options with no deadline and the default interval.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: None,
            interval: None,
        }
    }

    /// Sets the overall deadline.
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the polling interval.
    #[inline]
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
