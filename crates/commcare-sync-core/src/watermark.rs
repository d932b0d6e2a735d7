//! Watermarks: positions in a resource's stable total order.
//!
//! A [`Watermark`] is the tuple of a record's ordering-field values (for
//! forms, `server_modified_on` then `received_on`). Tuples compare
//! element-wise; a strict prefix sorts before every extension of it, so
//! the one-element watermark built from a `--since` / `--until` time is an
//! inclusive lower and an exclusive upper bound for every record at that
//! time.
//!
//! Scalars order as `null < bool < number < string`. Two strings that both
//! parse as timestamps compare chronologically, so `2012-01-01` and
//! `2012-01-01T10:00:00.000000Z` sort correctly against each other.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordering key of a record, or a bound on such keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(Vec<Value>);

impl Watermark {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// A bound at `time`, below every record ordered at or after it.
    pub fn from_time(time: DateTime<Utc>) -> Self {
        Self(vec![Value::String(format_timestamp(time))])
    }

    /// The ordering key of `record`. Missing fields read as `null`.
    pub fn of_record(record: &Value, order_by: &[String]) -> Self {
        Self(
            order_by
                .iter()
                .map(|field| record.get(field).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// The leading component as a timestamp, when it is one.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.0.first().and_then(Value::as_str).and_then(parse_timestamp)
    }

    /// Storage form: a compact JSON array.
    pub fn encode(&self) -> String {
        Value::Array(self.0.clone()).to_string()
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self)
    }
}

impl PartialEq for Watermark {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Watermark {}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_seq(&self.0, &other.0)
    }
}

fn compare_seq(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match compare_values(x, y) {
            Ordering::Equal => continue,
            unequal => return unequal,
        }
    }
    a.len().cmp(&b.len())
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values used for ordering keys.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::String(x), Value::String(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(tx), Some(ty)) => tx.cmp(&ty),
            _ => x.cmp(y),
        },
        (Value::Array(x), Value::Array(y)) => compare_seq(x, y),
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Parse the timestamp shapes seen in CommCare payloads and on the
/// command line: RFC 3339, naive date-times (taken as UTC), and bare
/// dates (midnight UTC).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = text.strip_suffix('Z').unwrap_or(text);
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Canonical text form used for time bounds.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(values: Value) -> Watermark {
        match values {
            Value::Array(v) => Watermark::new(v),
            other => Watermark::new(vec![other]),
        }
    }

    fn ts(text: &str) -> DateTime<Utc> {
        parse_timestamp(text).unwrap()
    }

    #[test]
    fn test_parse_timestamp_shapes() {
        let expected = ts("2012-03-04T10:11:12Z");
        assert_eq!(ts("2012-03-04T10:11:12"), expected);
        assert_eq!(ts("2012-03-04 10:11:12"), expected);
        assert_eq!(ts("2012-03-04T10:11:12.000000Z"), expected);
        assert_eq!(ts("2012-03-04T12:11:12+02:00"), expected);
        assert_eq!(ts("2012-03-04"), ts("2012-03-04T00:00:00Z"));
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("f1").is_none());
    }

    #[test]
    fn test_timestamps_compare_chronologically() {
        let a = key(json!(["2012-01-01"]));
        let b = key(json!(["2012-01-01T10:00:00.000000Z"]));
        assert!(a < b);
        assert_eq!(
            key(json!("2012-03-04T10:11:12Z")),
            key(json!("2012-03-04T10:11:12.000000Z"))
        );
    }

    #[test]
    fn test_prefix_is_inclusive_lower_bound() {
        let bound = Watermark::from_time(ts("2012-05-01"));
        let at_bound = key(json!(["2012-05-01T00:00:00Z", "2012-04-30T23:00:00Z"]));
        let before = key(json!(["2012-04-30T23:59:59Z", "2012-04-30T23:00:00Z"]));
        assert!(bound <= at_bound);
        assert!(before < bound);
    }

    #[test]
    fn test_tiebreak_on_secondary_field() {
        let a = key(json!(["2012-05-01T00:00:00Z", 1]));
        let b = key(json!(["2012-05-01T00:00:00Z", 2]));
        assert!(a < b);
        assert!(key(json!([null, 5])) < key(json!([false, 0])));
        assert!(key(json!([10])) < key(json!(["1"])));
        assert!(key(json!([2])) < key(json!([10])));
        assert!(key(json!([1.5])) < key(json!([2])));
    }

    #[test]
    fn test_of_record_and_encoding() {
        let record = json!({"id": 1, "server_modified_on": "2012-02-01T00:00:00Z"});
        let order = vec!["server_modified_on".to_string(), "received_on".to_string()];
        let w = Watermark::of_record(&record, &order);
        assert_eq!(w.values(), &[json!("2012-02-01T00:00:00Z"), Value::Null]);
        assert_eq!(w.time(), Some(ts("2012-02-01")));

        let decoded = Watermark::decode(&w.encode()).unwrap();
        assert_eq!(decoded, w);
        assert_eq!(decoded.values(), w.values());
    }

    #[test]
    fn test_format_timestamp_round_trips() {
        let t = ts("2012-08-01T05:06:07.123456Z");
        assert_eq!(format_timestamp(t), "2012-08-01T05:06:07.123456Z");
        assert_eq!(ts(&format_timestamp(t)), t);
    }
}
