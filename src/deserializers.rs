use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::Error;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Parses a backend timestamp. The history store writes naive ISO strings
/// (`2024-05-01T10:00:00.123456`) which are taken as UTC; RFC 3339 is accepted too.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = raw.parse::<DateTime<Utc>>() {
        return Some(ts);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Timestamp that accepts integer milliseconds, RFC 3339 and naive ISO strings.
/// `null` falls back to the current time.
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(Utc::now()),
        Value::Number(n) => {
            let ms = n.as_i64().ok_or_else(|| Error::custom("invalid timestamp"))?;
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| Error::custom("timestamp out of range"))
        }
        Value::String(s) => {
            parse_timestamp(&s).ok_or_else(|| Error::custom(format!("invalid timestamp: {}", s)))
        }
        _ => Err(Error::custom("timestamp must be a number or string")),
    }
}

/// Flag that the backend may send as a bool, a (possibly empty) string or null.
pub fn deserialize_truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        Value::Number(n) => n.as_i64().map(|n| n != 0).unwrap_or(true),
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    })
}

/// Optional string field that may arrive as a string, a number or null.
pub fn deserialize_loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[derive(Deserialize)]
    struct Stamped {
        #[serde(deserialize_with = "deserialize_timestamp")]
        at: DateTime<Utc>,
    }

    #[derive(Deserialize)]
    struct Flagged {
        #[serde(default, deserialize_with = "deserialize_truthy")]
        on: bool,
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let stamped: Stamped = serde_json::from_str(r#"{"at": "2024-05-01T10:11:12.345678"}"#).unwrap();
        assert_eq!(stamped.at.year(), 2024);
        assert_eq!(stamped.at.hour(), 10);
        assert_eq!(stamped.at.second(), 12);
    }

    #[test]
    fn test_rfc3339_and_millis() {
        let a: Stamped = serde_json::from_str(r#"{"at": "2025-11-02T09:41:20.016Z"}"#).unwrap();
        let b: Stamped = serde_json::from_str(r#"{"at": 1762076480016}"#).unwrap();
        assert_eq!(a.at, b.at);
    }

    #[test]
    fn test_truthy_flags() {
        let cases = [
            (r#"{"on": true}"#, true),
            (r#"{"on": "cosmos-account"}"#, true),
            (r#"{"on": ""}"#, false),
            (r#"{"on": null}"#, false),
            (r#"{}"#, false),
        ];
        for (json, expected) in cases {
            let flagged: Flagged = serde_json::from_str(json).unwrap();
            assert_eq!(flagged.on, expected, "input {}", json);
        }
    }
}
