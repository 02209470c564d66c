//! Opaque cursor-based pagination for list queries.
//!
//! List endpoints order by a `(timestamp, id)` sort key descending and return
//! an opaque cursor for the next page. The cursor is the base64-encoded sort
//! key of the last row returned; callers treat it as a token and never parse
//! it.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

// ============================================================================
// Cursor
// ============================================================================

/// Opaque keyset cursor (base64 of `timestamp|uuid`).
///
/// The timestamp carries nanosecond precision so ties are broken by the id
/// component alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub sort_key: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    /// Create a cursor from a sort key and row id.
    pub fn new(sort_key: DateTime<Utc>, id: Uuid) -> Self {
        Cursor { sort_key, id }
    }

    /// Encode the cursor as an opaque base64 string.
    pub fn encode(&self) -> String {
        let raw = format!(
            "{}|{}",
            self.sort_key.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.id
        );
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    /// Decode a cursor string back to its sort key components.
    pub fn decode(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .context("Invalid cursor: not valid base64")?;
        let raw = String::from_utf8(bytes).context("Invalid cursor: not valid UTF-8")?;
        let (ts, id) = raw
            .split_once('|')
            .context("Invalid cursor: missing separator")?;
        let sort_key = DateTime::parse_from_rfc3339(ts)
            .context("Invalid cursor: bad timestamp")?
            .with_timezone(&Utc);
        let id = Uuid::parse_str(id).context("Invalid cursor: bad id")?;
        Ok(Cursor { sort_key, id })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Clamp a requested page size to 1..=100, defaulting to 25.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(25).clamp(1, 100)
}

/// Trim results to the requested limit and determine if there are more.
///
/// Queries fetch `limit + 1` rows; the extra row only signals another page.
pub fn trim_results<T>(results: Vec<T>, limit: i64) -> (Vec<T>, bool) {
    let has_more = results.len() > limit as usize;
    let results = if has_more {
        results.into_iter().take(limit as usize).collect()
    } else {
        results
    };
    (results, has_more)
}

/// Build the next-page cursor from the last row of a full page.
pub fn next_cursor<T>(
    rows: &[T],
    has_more: bool,
    sort_key: impl Fn(&T) -> (DateTime<Utc>, Uuid),
) -> Option<String> {
    if !has_more {
        return None;
    }
    rows.last().map(|row| {
        let (ts, id) = sort_key(row);
        Cursor::new(ts, id).encode()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cursor_encode_decode() {
        let ts = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
        let id = Uuid::new_v4();
        let cursor = Cursor::new(ts, id);
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(cursor, decoded);
    }

    #[test]
    fn test_cursor_preserves_subsecond_precision() {
        let ts = Utc.timestamp_opt(1_738_836_000, 123_456_789).unwrap();
        let cursor = Cursor::new(ts, Uuid::new_v4());
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded.sort_key, ts);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(Cursor::decode("not-base64!!!").is_err());
        let bad = URL_SAFE_NO_PAD.encode(b"no separator here");
        assert!(Cursor::decode(&bad).is_err());
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), 25);
        assert_eq!(clamp_limit(Some(10)), 10);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(500)), 100);
    }

    #[test]
    fn test_trim_results() {
        let items: Vec<i32> = (1..=12).collect();
        let (trimmed, has_more) = trim_results(items, 10);
        assert_eq!(trimmed.len(), 10);
        assert!(has_more);

        let items: Vec<i32> = (1..=5).collect();
        let (trimmed, has_more) = trim_results(items, 10);
        assert_eq!(trimmed.len(), 5);
        assert!(!has_more);
    }

    #[test]
    fn test_next_cursor_only_on_full_pages() {
        let ts = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
        let rows = vec![(ts, Uuid::new_v4()), (ts, Uuid::new_v4())];
        assert!(next_cursor(&rows, false, |r| *r).is_none());
        let token = next_cursor(&rows, true, |r| *r).unwrap();
        let decoded = Cursor::decode(&token).unwrap();
        assert_eq!(decoded.id, rows[1].1);
    }
}
