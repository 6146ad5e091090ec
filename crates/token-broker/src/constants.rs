//! Constants for the broker server

use std::time::Duration;

/// How long abandoned handlers get to finish with `Cancelled` after the drain deadline
pub const ABANDON_GRACE: Duration = Duration::from_millis(500);

/// Consecutive non-connection accept errors tolerated before the listener gives up
pub const MAX_ACCEPT_RETRIES: u32 = 10;

/// First accept retry delay, doubled per consecutive error
pub const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(50);

/// Accept retry delay ceiling
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);
