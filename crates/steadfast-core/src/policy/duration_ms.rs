//! Serde support for durations in policy files.
//!
//! Accepts integer milliseconds (`250`) or humantime strings (`"250ms"`,
//! `"2s"`, `"1m 30s"`). Always serializes as integer milliseconds.

use serde::de::{self, Deserializer, Visitor};
use serde::Serializer;
use std::fmt;
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(DurationVisitor)
}

/// Parse a duration the same way policy files do.
pub fn parse(value: &str) -> Result<Duration, humantime::DurationError> {
    match value.trim().parse::<u64>() {
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(_) => humantime::parse_duration(value.trim()),
    }
}

struct DurationVisitor;

impl<'de> Visitor<'de> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("milliseconds or a duration string such as \"250ms\"")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
        Ok(Duration::from_millis(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
        u64::try_from(v)
            .map(Duration::from_millis)
            .map_err(|_| E::custom(format!("negative duration: {v}")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
        if v.is_finite() && v >= 0.0 {
            Ok(Duration::from_micros((v * 1000.0) as u64))
        } else {
            Err(E::custom(format!("invalid duration: {v}")))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
        parse(v).map_err(|e| E::custom(format!("invalid duration '{v}': {e}")))
    }
}

/// Map of keys to durations, with the same accepted forms.
pub mod map {
    use super::DurationVisitor;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Entry(Duration);

    impl<'de> Deserialize<'de> for Entry {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_any(DurationVisitor).map(Entry)
        }
    }

    pub fn serialize<K, S>(map: &BTreeMap<K, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize + Ord,
        S: Serializer,
    {
        let millis: BTreeMap<&K, u64> = map
            .iter()
            .map(|(k, v)| (k, v.as_millis() as u64))
            .collect();
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, K, D>(deserializer: D) -> Result<BTreeMap<K, Duration>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        D: Deserializer<'de>,
    {
        let raw: BTreeMap<K, Entry> = BTreeMap::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|(k, Entry(v))| (k, v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(with = "crate::policy::duration_ms")]
        value: Duration,
    }

    #[test]
    fn test_accepts_millis_and_humantime() {
        let probe: Probe = serde_json::from_str(r#"{"value": 250}"#).unwrap();
        assert_eq!(probe.value, Duration::from_millis(250));

        let probe: Probe = serde_json::from_str(r#"{"value": "2s"}"#).unwrap();
        assert_eq!(probe.value, Duration::from_secs(2));

        let probe: Probe = serde_yaml::from_str("value: 1m 30s").unwrap();
        assert_eq!(probe.value, Duration::from_secs(90));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(serde_json::from_str::<Probe>(r#"{"value": "soon"}"#).is_err());
        assert!(serde_json::from_str::<Probe>(r#"{"value": -5}"#).is_err());
    }

    #[test]
    fn test_parse_plain_number_is_millis() {
        assert_eq!(parse("1500").unwrap(), Duration::from_millis(1500));
    }
}
