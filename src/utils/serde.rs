/*!
 * Serde utilities for common serialization/deserialization patterns.
 *
 * Configuration files express every delay as an integer number of
 * milliseconds, while the runtime structs carry `std::time::Duration`.
 * The helpers here bridge the two so each struct stays a plain
 * `#[derive(Serialize, Deserialize)]`.
 */

/// Serialize a `Duration` as whole milliseconds.
///
/// Deserialization accepts integers, floats (truncated) and numeric strings so
/// that values coming from environment variables (always strings) parse the
/// same way as values from TOML files.
///
/// # Usage with serde
///
/// ```rust
/// use serde::Deserialize;
/// use std::time::Duration;
///
/// #[derive(Deserialize)]
/// struct Backoff {
///     #[serde(with = "dbcoord::utils::serde::duration_millis")]
///     initial_delay: Duration,
/// }
///
/// let parsed: Backoff = serde_json::from_str(r#"{"initial_delay": 250}"#).unwrap();
/// assert_eq!(parsed.initial_delay, Duration::from_millis(250));
/// ```
pub mod duration_millis {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Millis {
            Int(u64),
            Float(f64),
            Text(String),
        }

        match Millis::deserialize(deserializer)? {
            Millis::Int(ms) => Ok(Duration::from_millis(ms)),
            Millis::Float(ms) if ms >= 0.0 && ms.is_finite() => {
                Ok(Duration::from_millis(ms as u64))
            }
            Millis::Float(ms) => Err(D::Error::custom(format!(
                "Expected a non-negative millisecond value, found: {ms}"
            ))),
            Millis::Text(s) => s
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| D::Error::custom(format!("Cannot parse '{s}' as milliseconds"))),
        }
    }
}
