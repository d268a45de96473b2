//! JSON field support.

use mime::Mime;
use serde_json::Value;

/// Returns true if a part with this Content-Type carries a JSON value.
///
/// Matches `application/json`, `text/json` and any `+json` structured syntax suffix. Parameters
/// such as `charset` are ignored.
pub fn is_json_mime(mime: &Mime) -> bool {
    let (ty, sub) = (mime.type_(), mime.subtype());

    (sub == mime::JSON && (ty == mime::APPLICATION || ty == mime::TEXT))
        || mime.suffix() == Some(mime::JSON)
}

/// Parses a JSON document, rejecting values that could pollute object prototypes downstream.
///
/// Any object holding a `__proto__` key is refused, as is any `constructor` key whose value is an
/// object holding a `prototype` key.
pub(crate) fn parse_secure(input: &str) -> Result<Value, serde_json::Error> {
    let value = serde_json::from_str::<Value>(input)?;

    if is_polluting(&value) {
        return Err(serde::de::Error::custom("object contains a forbidden prototype property"));
    }

    Ok(value)
}

fn is_polluting(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.iter().any(|(key, val)| {
            key == "__proto__"
                || (key == "constructor"
                    && val.as_object().is_some_and(|obj| obj.contains_key("prototype")))
                || is_polluting(val)
        }),

        Value::Array(items) => items.iter().any(is_polluting),

        _ => false,
    }
}
