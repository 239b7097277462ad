//! Typed access to a command's loosely-typed argument map.

use super::ValidationError;
use serde_json::{Map, Value};

/// Reads arguments for one action, naming the action in every error.
pub struct ArgReader<'a> {
    action: &'static str,
    args: &'a Map<String, Value>,
}

impl<'a> ArgReader<'a> {
    #[must_use]
    pub fn new(action: &'static str, args: &'a Map<String, Value>) -> Self {
        Self { action, args }
    }

    fn missing(&self, arg: &str) -> ValidationError {
        ValidationError::MissingArgument {
            action: self.action,
            arg: arg.to_owned(),
        }
    }

    fn malformed(&self, arg: &str, expected: &str) -> ValidationError {
        ValidationError::MalformedArgument {
            action: self.action,
            arg: arg.to_owned(),
            expected: expected.to_owned(),
        }
    }

    /// First present, non-null value among `names`.
    fn lookup(&self, names: &[&str]) -> Option<&'a Value> {
        names
            .iter()
            .find_map(|n| self.args.get(*n).filter(|v| !v.is_null()))
    }

    /// Non-blank string, trimmed. Also accepts aliases after the first name.
    pub fn required_str(&self, names: &[&str]) -> Result<String, ValidationError> {
        self.optional_str(names)?.ok_or_else(|| self.missing(names[0]))
    }

    /// Trimmed string; absent and blank both read as `None`.
    pub fn optional_str(&self, names: &[&str]) -> Result<Option<String>, ValidationError> {
        match self.lookup(names) {
            None => Ok(None),
            Some(Value::String(s)) => {
                let s = s.trim();
                Ok((!s.is_empty()).then(|| s.to_owned()))
            }
            Some(_) => Err(self.malformed(names[0], "string")),
        }
    }

    /// Integer within `[min, max]`, given as a JSON number or a numeric string.
    pub fn optional_int(&self, name: &str, min: i64, max: i64) -> Result<Option<i64>, ValidationError> {
        let expected = || format!("integer in {min}..={max}");
        let n = match self.lookup(&[name]) {
            None => return Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            Some(_) => None,
        };
        match n {
            Some(n) if (min..=max).contains(&n) => Ok(Some(n)),
            _ => Err(self.malformed(name, &expected())),
        }
    }

    /// Boolean given as a JSON bool, 0/1, or a `true`/`false` style string.
    pub fn optional_bool(&self, name: &str) -> Result<Option<bool>, ValidationError> {
        match self.lookup(&[name]) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::Number(n)) if n.as_i64() == Some(0) => Ok(Some(false)),
            Some(Value::Number(n)) if n.as_i64() == Some(1) => Ok(Some(true)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                _ => Err(self.malformed(name, "bool")),
            },
            Some(_) => Err(self.malformed(name, "bool")),
        }
    }

    /// Required JSON array.
    pub fn required_array(&self, name: &str) -> Result<&'a Vec<Value>, ValidationError> {
        match self.lookup(&[name]) {
            None => Err(self.missing(name)),
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(self.malformed(name, "array")),
        }
    }

    /// Malformed-argument error for values that fail a domain check.
    #[must_use]
    pub fn invalid(&self, arg: &str, expected: &str) -> ValidationError {
        self.malformed(arg, expected)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!("test input must be an object"),
        }
    }

    #[test]
    fn required_str_missing_and_blank() {
        let args = map(json!({"text": "   "}));
        let r = ArgReader::new("tts.say", &args);
        let err = r.required_str(&["text"]).unwrap_err();
        assert_eq!(err.to_string(), "tts.say missing args.text");
    }

    #[test]
    fn required_str_alias() {
        let args = map(json!({"source_url": "http://x/b.zip"}));
        let r = ArgReader::new("bundle.apply", &args);
        assert_eq!(r.required_str(&["url", "source_url"]).unwrap(), "http://x/b.zip");
    }

    #[test]
    fn string_where_number_given_is_malformed() {
        let args = map(json!({"file": 12}));
        let r = ArgReader::new("audio.play", &args);
        let err = r.required_str(&["file"]).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedArgument { .. }));
        assert!(err.to_string().contains("expected string"));
    }

    #[test]
    fn int_accepts_numeric_string() {
        let args = map(json!({"volume": "75", "port": 8554.0}));
        let r = ArgReader::new("audio.play", &args);
        assert_eq!(r.optional_int("volume", 0, 100).unwrap(), Some(75));
        assert_eq!(r.optional_int("port", 1, 65535).unwrap(), Some(8554));
        assert_eq!(r.optional_int("fps", 1, 120).unwrap(), None);
    }

    #[test]
    fn int_out_of_range_is_malformed() {
        let args = map(json!({"volume": 140}));
        let r = ArgReader::new("audio.play", &args);
        let err = r.optional_int("volume", 0, 100).unwrap_err();
        assert!(err.to_string().contains("args.volume"));
    }

    #[test]
    fn bool_forms() {
        let args = map(json!({"a": true, "b": "no", "c": 1, "d": "maybe"}));
        let r = ArgReader::new("audio.play", &args);
        assert_eq!(r.optional_bool("a").unwrap(), Some(true));
        assert_eq!(r.optional_bool("b").unwrap(), Some(false));
        assert_eq!(r.optional_bool("c").unwrap(), Some(true));
        assert!(r.optional_bool("d").is_err());
        assert_eq!(r.optional_bool("e").unwrap(), None);
    }
}
