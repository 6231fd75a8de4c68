use serde_json::Value;

pub(crate) fn id_of(value: &Value) -> Option<&str> {
    value
        .get("id")
        .or_else(|| value.get("@id"))
        .and_then(Value::as_str)
}

pub(crate) fn type_of(value: &Value) -> Option<&str> {
    value
        .get("type")
        .or_else(|| value.get("@type"))
        .and_then(Value::as_str)
}

/// Treats a missing field as empty, an array as its elements and anything
/// else as a single element.
pub(crate) fn one_or_many(value: Option<&Value>) -> Vec<&Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
    }
}

/// A reference that may be a bare string or an object carrying an id.
pub(crate) fn ref_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(_) => id_of(value),
        _ => None,
    }
}

pub(crate) fn dimension(value: &Value, key: &str) -> Option<u32> {
    let raw = value.get(key)?;
    raw.as_u64()
        .or_else(|| raw.as_f64().filter(|v| *v >= 0.0).map(|v| v.round() as u64))
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
}

/// Resolves a `label`: plain string, language map or list of `@value`s.
pub(crate) fn label_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => item
                        .get("@value")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    _ => None,
                })
                .collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        }
        Value::Object(map) => {
            if let Some(v) = map.get("@value").and_then(Value::as_str) {
                return Some(v.to_owned());
            }
            let entries = map
                .get("en")
                .or_else(|| map.get("none"))
                .or_else(|| map.values().next())?;
            let parts: Vec<&str> = one_or_many(Some(entries))
                .into_iter()
                .filter_map(Value::as_str)
                .collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        }
        _ => None,
    }
}

/// Text before the first `#`.
pub(crate) fn strip_fragment(target: &str) -> &str {
    target.split('#').next().unwrap_or(target)
}
