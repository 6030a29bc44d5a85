//! Core value types shared across the control plane

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as epoch milliseconds
///
/// All persisted timestamps (lock leases, record update times, TEMP
/// expirations) use this representation.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Opaque continuation token for cursor-paginated traversals
///
/// The token is only meaningful to the store that issued it and must be
/// presented again within its keep-alive window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollCursor {
    /// Store-issued continuation token
    pub token: String,
    /// Server-side cursor timeout (milliseconds), renewed on each page
    pub keep_alive_ms: u64,
}

impl ScrollCursor {
    /// Create a new cursor
    pub fn new(token: impl Into<String>, keep_alive_ms: u64) -> Self {
        Self {
            token: token.into(),
            keep_alive_ms,
        }
    }
}

/// One page of results plus the cursor to fetch the next one
///
/// `cursor` is `None` for offset-paginated listings and for the final page
/// of a cursor traversal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PagedResult<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Total matching items, when the store reports it
    pub total: u64,
    /// Continuation cursor, if more pages may follow
    pub cursor: Option<ScrollCursor>,
}

impl<T> PagedResult<T> {
    /// A page with no continuation
    #[must_use]
    pub const fn finished(items: Vec<T>, total: u64) -> Self {
        Self {
            items,
            total,
            cursor: None,
        }
    }

    /// True when no further pages follow
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.cursor.is_none()
    }
}
