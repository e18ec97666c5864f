//! Cached `Date:` header value.
//!
//! HTTP dates have one-second resolution, so the formatted string is
//! refreshed at most once per second instead of on every response.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) struct DateService {
    cached: Mutex<(u64, String)>,
}

impl DateService {
    pub(crate) fn new() -> Self {
        let now = SystemTime::now();
        let secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        DateService {
            cached: Mutex::new((secs, httpdate::fmt_http_date(now))),
        }
    }

    /// Current RFC 7231 date string, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
    pub(crate) fn header_value(&self) -> String {
        let now = SystemTime::now();
        let secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut cached = self.cached.lock().unwrap();
        if cached.0 != secs {
            *cached = (secs, httpdate::fmt_http_date(now));
        }
        cached.1.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_parses_back() {
        let svc = DateService::new();
        let value = svc.header_value();
        assert!(httpdate::parse_http_date(&value).is_ok());
        assert!(value.ends_with("GMT"));
    }

    #[test]
    fn cached_within_second() {
        let svc = DateService::new();
        assert_eq!(svc.header_value(), svc.header_value());
    }
}
