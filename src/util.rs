//! Shared helpers: monetary rounding, book-day truncation, timestamp text.

use chrono::{DateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;

/// Decimal places used when comparing debit and credit totals.
pub const BALANCE_PRECISION: u32 = 5;

/// Timezone that defines a book day.
pub const BOOK_TZ: Tz = chrono_tz::Asia::Jakarta;

/// Round half away from zero to `precision` decimal places.
pub fn round_to_precision(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// True when two totals agree at `BALANCE_PRECISION`.
pub fn amounts_equal(a: f64, b: f64) -> bool {
    round_to_precision(a, BALANCE_PRECISION) == round_to_precision(b, BALANCE_PRECISION)
}

/// True when an amount rounds to zero at `BALANCE_PRECISION`.
pub fn is_zero_amount(value: f64) -> bool {
    round_to_precision(value, BALANCE_PRECISION) == 0.0
}

/// Truncate a UTC instant to the start of its Asia/Jakarta day, expressed in UTC.
///
/// `2024-03-01T18:30:00Z` is `2024-03-02 01:30` in Jakarta, so its book day
/// starts at `2024-03-02T00:00+07:00`, i.e. `2024-03-01T17:00:00Z`.
pub fn book_day(at: DateTime<Utc>) -> DateTime<Utc> {
    let local = at.with_timezone(&BOOK_TZ);
    let midnight = local.date_naive().and_time(NaiveTime::MIN);
    // Jakarta has no DST, so local midnight always exists exactly once.
    BOOK_TZ
        .from_local_datetime(&midnight)
        .earliest()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(at)
}

/// Canonical text form for stored timestamps.
pub fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp back into UTC.
pub fn from_db_time(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|d| d.with_timezone(&Utc))
}

/// Map a text-parse failure into the error rusqlite expects from row mappers.
pub fn parse_time_column(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    from_db_time(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
