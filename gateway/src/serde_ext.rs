//! Serde helpers for hand-written service and gateway YAML.
//!
//! Service files are edited by people: timeouts show up as `6` or `"6"`, environment values as
//! bare numbers or booleans, CORS origins as one string or a list. These helpers accept the loose
//! forms and hand the rest of the crate a single shape.

use std::{collections::HashMap, fmt};

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};

pub fn de_u64_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> Visitor<'de> for V {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an integer (u64) or a string containing an integer")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u64::try_from(v).map_err(|_| E::custom("expected a non-negative integer"))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if !v.is_finite() || v < 0.0 || v.fract() != 0.0 {
                return Err(E::custom("expected a non-negative whole number"));
            }
            Ok(v as u64)
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            v.trim()
                .parse::<u64>()
                .map_err(|_| E::custom("expected a string containing an integer"))
        }
    }

    deserializer.deserialize_any(V)
}

pub fn de_option_u64_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> Visitor<'de> for V {
        type Value = Option<u64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an optional integer (u64) or a string containing an integer")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
        where
            D: Deserializer<'de>,
        {
            de_u64_or_string(deserializer).map(Some)
        }
    }

    deserializer.deserialize_option(V)
}

pub fn de_usize_or_string<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let v = de_u64_or_string(deserializer)?;
    usize::try_from(v).map_err(|_| de::Error::custom("integer is too large for usize"))
}

/// A single string or a list of strings, always returned as a list.
pub fn de_string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> Visitor<'de> for V {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a list of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut out = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                out.push(item);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(V)
}

/// A string-to-scalar map whose values are stringified (`PORT: 8080` becomes `"8080"`).
pub fn de_scalar_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> Visitor<'de> for V {
        type Value = HashMap<String, String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map of scalar values")
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(HashMap::new())
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut out = HashMap::new();
            while let Some((key, value)) = map.next_entry::<String, serde_json::Value>()? {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    v @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_)) => v.to_string(),
                    _ => {
                        return Err(de::Error::custom(format!(
                            "value for {key:?} must be a scalar"
                        )))
                    }
                };
                out.insert(key, value);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(V)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct T {
        #[serde(deserialize_with = "de_u64_or_string")]
        v: u64,
        #[serde(deserialize_with = "de_usize_or_string")]
        n: usize,
        #[serde(default, deserialize_with = "de_option_u64_or_string")]
        o: Option<u64>,
        #[serde(default, deserialize_with = "de_string_or_seq")]
        s: Vec<String>,
        #[serde(default, deserialize_with = "de_scalar_map")]
        env: HashMap<String, String>,
    }

    #[test]
    fn parses_numbers_and_strings() {
        let yaml = br#"
v: "25"
n: "4"
o: 12
s: "*"
env:
  PORT: 8080
  DEBUG: true
  NAME: svc
"#;
        let t: T = serde_yaml::from_slice(yaml).unwrap();
        assert_eq!(t.v, 25);
        assert_eq!(t.n, 4);
        assert_eq!(t.o, Some(12));
        assert_eq!(t.s, vec!["*".to_string()]);
        assert_eq!(t.env["PORT"], "8080");
        assert_eq!(t.env["DEBUG"], "true");
        assert_eq!(t.env["NAME"], "svc");
    }

    #[test]
    fn optional_fields_default() {
        let yaml = br#"
v: 1
n: 1
s: [a, b]
"#;
        let t: T = serde_yaml::from_slice(yaml).unwrap();
        assert_eq!(t.o, None);
        assert_eq!(t.s, vec!["a".to_string(), "b".to_string()]);
        assert!(t.env.is_empty());
    }

    #[test]
    fn nested_environment_values_are_rejected() {
        let yaml = br#"
v: 1
n: 1
env:
  NESTED: { a: 1 }
"#;
        assert!(serde_yaml::from_slice::<T>(yaml).is_err());
    }
}
