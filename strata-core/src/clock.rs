use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;

use crate::error::{GraphError, Result};

/// Stamps records with RFC 3339 timestamps in a fixed IANA zone.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    tz: Tz,
}

impl Clock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        let tz: Tz = name
            .parse()
            .map_err(|_| GraphError::Validation(format!("unknown timezone: {}", name)))?;
        Ok(Self { tz })
    }

    pub fn now(&self) -> String {
        Utc::now().with_timezone(&self.tz).to_rfc3339()
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            tz: chrono_tz::Pacific::Auckland,
        }
    }
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value).ok()
}

/// Newest first by instant, ties broken by the raw text. Unparseable
/// timestamps sort after every parseable one, among themselves by raw text
/// descending.
pub fn newest_first(a: &str, b: &str) -> Ordering {
    match (parse_timestamp(a), parse_timestamp(b)) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| b.cmp(a)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.cmp(a),
    }
}
