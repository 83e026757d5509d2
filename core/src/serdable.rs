//! serde adapters for types stored in reports.

/// `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use ::serde::{
        de::{self, Visitor},
        Deserializer, Serializer,
    };

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MillisVisitor;

        impl<'de> Visitor<'de> for MillisVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "a non-negative number of milliseconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_millis(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u64::try_from(v)
                    .map(Duration::from_millis)
                    .map_err(|_| E::custom("negative duration"))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if v.is_finite() && v >= 0.0 {
                    Ok(Duration::from_secs_f64(v / 1000.0))
                } else {
                    Err(E::custom("invalid duration"))
                }
            }
        }

        deserializer.deserialize_any(MillisVisitor)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timed {
        #[serde(with = "super::duration_ms")]
        took: Duration,
    }

    #[test]
    fn should_store_whole_millis() {
        let t = Timed {
            took: Duration::from_micros(1_500_900),
        };
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"{"took":1500}"#);
        let back: Timed = serde_json::from_str(&json).unwrap();
        assert_eq!(back.took, Duration::from_millis(1500));
    }
}
