//! Query-string codec for the value tree.
//!
//! Decodes `a=1&b[c]=2&b[d]=x` style query strings into nested
//! objects, and encodes the inverse. Keys and values are
//! percent-decoded; `+` reads as space.

use super::Serializer;
use crate::uri::{urldecode, urlencode};
use crate::{Error, Result, SObj, SVal};

#[derive(Debug, Default)]
pub struct UrlSerializer;

impl Serializer for UrlSerializer {
    fn name(&self) -> &'static str {
        "uri"
    }

    fn encode(&self, value: &SVal) -> Result<String> {
        let mut parts = Vec::new();
        encode_value(&mut parts, "", value)
            .map_err(|e| Error::Protocol(format!("can't encode into uri: {e}")))?;
        Ok(parts.join("&"))
    }

    fn decode(&self, input: &str) -> Result<SVal> {
        let mut root = SObj::new();
        for pair in input.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            emplace(&mut root, key, value)
                .map_err(|e| Error::Protocol(format!("can't decode uri: {e}")))?;
        }
        Ok(SVal::Object(root))
    }
}

/// Insert `value` under a possibly bracketed key path like `a[b][c]`.
fn emplace(parent: &mut SObj, keyline: &str, value: &str) -> Result<()> {
    let (key, rest) = if let Some(stripped) = keyline.strip_prefix('[') {
        let close = stripped
            .find(']')
            .ok_or_else(|| Error::Protocol("not found close brace".into()))?;
        (&stripped[..close], &stripped[close + 1..])
    } else {
        match keyline.find('[') {
            Some(open) => (&keyline[..open], &keyline[open..]),
            None => (keyline, ""),
        }
    };

    let key = urldecode(key);
    if key.is_empty() {
        return Err(Error::Protocol("empty key".into()));
    }

    if rest.is_empty() {
        parent.emplace(key, decode_scalar(&urldecode(value)));
        return Ok(());
    }

    if parent.get(&key).as_object().is_none() {
        parent.emplace(key.clone(), SObj::new());
    }
    match parent.get_mut(&key) {
        Some(SVal::Object(child)) => emplace(child, rest, value),
        _ => Err(Error::Protocol(format!("key `{key}` is not an object"))),
    }
}

/// Recognize scalars the way the wire writes them: integers, floats,
/// booleans and null; everything else stays a string.
fn decode_scalar(raw: &str) -> SVal {
    if raw.is_empty() {
        return SVal::Str(String::new());
    }
    match raw {
        "true" => return SVal::Bool(true),
        "false" => return SVal::Bool(false),
        "null" => return SVal::Null,
        _ => {}
    }

    let numeric_shape = {
        let body = raw.strip_prefix(['-', '+']).unwrap_or(raw);
        !body.is_empty() && body.chars().next().is_some_and(|c| c.is_ascii_digit())
    };
    if numeric_shape {
        // Over 19 digits an integer would silently truncate.
        let digits = raw.chars().filter(|c| c.is_ascii_digit()).count();
        if digits <= 19 {
            if let Ok(v) = raw.parse::<i64>() {
                return SVal::Int(v);
            }
        }
        if let Ok(v) = raw.parse::<f64>() {
            return SVal::Float(v);
        }
    }

    SVal::Str(raw.to_string())
}

fn encode_value(parts: &mut Vec<String>, prefix: &str, value: &SVal) -> Result<()> {
    match value {
        SVal::Object(obj) => {
            for (key, member) in obj.iter() {
                let child_prefix = if prefix.is_empty() {
                    urlencode(key)
                } else {
                    format!("{prefix}[{}]", urlencode(key))
                };
                encode_value(parts, &child_prefix, member)?;
            }
            Ok(())
        }
        SVal::Array(items) => {
            if prefix.is_empty() {
                return Err(Error::Protocol("top level must be an object".into()));
            }
            for (index, item) in items.iter().enumerate() {
                encode_value(parts, &format!("{prefix}[{index}]"), item)?;
            }
            Ok(())
        }
        scalar => {
            if prefix.is_empty() {
                return Err(Error::Protocol("top level must be an object".into()));
            }
            parts.push(format!("{prefix}={}", encode_scalar(scalar)?));
            Ok(())
        }
    }
}

fn encode_scalar(value: &SVal) -> Result<String> {
    Ok(match value {
        SVal::Null => "null".to_string(),
        SVal::Bool(v) => v.to_string(),
        SVal::Int(v) => v.to_string(),
        SVal::Float(v) => v.to_string(),
        SVal::Str(v) => urlencode(v),
        SVal::Binary(v) => urlencode(&String::from_utf8_lossy(v)),
        SVal::Array(_) | SVal::Object(_) => {
            return Err(Error::Protocol("nested value reached scalar encoder".into()))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(input: &str) -> SObj {
        UrlSerializer.decode(input).unwrap().into_object().unwrap()
    }

    #[test]
    fn test_flat_pairs() {
        let obj = decode("a=1&b=x%20y&c=2.5&d=true&e=null&f=");
        assert_eq!(obj.get_int("a"), Some(1));
        assert_eq!(obj.get_str("b"), Some("x y"));
        assert_eq!(obj.get("c"), &SVal::Float(2.5));
        assert_eq!(obj.get_bool("d"), Some(true));
        assert!(obj.get("e").is_null());
        assert_eq!(obj.get_str("f"), Some(""));
    }

    #[test]
    fn test_nested_keys() {
        let obj = decode("user[name]=ana&user[stats][wins]=3");
        let user = obj.get("user").as_object().unwrap();
        assert_eq!(user.get_str("name"), Some("ana"));
        assert_eq!(
            user.get("stats").as_object().unwrap().get_int("wins"),
            Some(3)
        );
    }

    #[test]
    fn test_plus_is_space_in_query() {
        let obj = decode("q=hello+world");
        assert_eq!(obj.get_str("q"), Some("hello world"));
    }

    #[test]
    fn test_unterminated_bracket_is_error() {
        assert!(UrlSerializer.decode("a[b=1").is_err());
    }

    #[test]
    fn test_numeric_looking_strings() {
        let obj = decode("big=12345678901234567890123&ver=1.2.3");
        // 23 digits cannot be an i64; it degrades to a float.
        assert!(matches!(obj.get("big"), SVal::Float(v) if *v > 1.0e22));
        assert_eq!(obj.get_str("ver"), Some("1.2.3"));
    }

    #[test]
    fn test_roundtrip_nested_object() {
        let mut stats = SObj::new();
        stats.emplace("wins", 3i64);
        stats.emplace("ratio", 0.75f64);
        let mut user = SObj::new();
        user.emplace("name", "ana maria");
        user.emplace("stats", stats);
        let mut root = SObj::new();
        root.emplace("user", user);
        root.emplace("ok", true);

        let encoded = UrlSerializer.encode(&SVal::Object(root.clone())).unwrap();
        let decoded = UrlSerializer.decode(&encoded).unwrap();
        assert_eq!(decoded, SVal::Object(root));
    }

    #[test]
    fn test_top_level_scalar_rejected() {
        assert!(UrlSerializer.encode(&SVal::Int(1)).is_err());
    }
}
