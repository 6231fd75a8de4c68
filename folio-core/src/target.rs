//! Reduces annotation targets to `<canvas>` or `<canvas>#<fragment>` strings.

use serde_json::Value;

use crate::json::{self, strip_fragment};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// A selector written directly as a string.
    Literal(String),
    Fragment(String),
    Svg(String),
    /// Any other selector exposing a string `value`.
    Value(String),
    TextQuote {
        prefix: Option<String>,
        exact: Option<String>,
        suffix: Option<String>,
    },
    Region(String),
    Choice(Vec<Selector>),
    Unsupported,
}

impl Selector {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Selector::Literal(s.clone()),
            Value::Array(items) => Selector::Choice(items.iter().map(Selector::from_value).collect()),
            Value::Object(map) => {
                let declared = json::type_of(value);
                let text = map.get("value").and_then(Value::as_str);
                match (declared, text) {
                    (Some("SvgSelector"), Some(svg)) => return Selector::Svg(svg.to_owned()),
                    (Some("FragmentSelector"), Some(fragment)) => {
                        return Selector::Fragment(fragment.to_owned())
                    }
                    (_, Some(text)) => return Selector::Value(text.to_owned()),
                    _ => {}
                }
                if declared == Some("TextQuoteSelector") {
                    let field = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_owned);
                    return Selector::TextQuote {
                        prefix: field("prefix"),
                        exact: field("exact"),
                        suffix: field("suffix"),
                    };
                }
                match map.get("region") {
                    Some(Value::String(region)) => Selector::Region(region.clone()),
                    Some(Value::Null) | None => Selector::Unsupported,
                    Some(other) => Selector::Region(other.to_string()),
                }
            }
            _ => Selector::Unsupported,
        }
    }

    /// The URL fragment (without `#`) this selector narrows to.
    pub fn fragment(&self) -> Option<String> {
        let fragment = match self {
            Selector::Literal(raw) | Selector::Value(raw) => raw.trim_start_matches('#').to_owned(),
            Selector::Fragment(raw) => raw.clone(),
            Selector::Svg(svg) => format!("svg={}", urlencoding::encode(svg)),
            Selector::TextQuote {
                prefix,
                exact,
                suffix,
            } => format!(
                "text={}{}{}",
                encode_opt(prefix),
                encode_opt(exact),
                encode_opt(suffix)
            ),
            Selector::Region(region) => format!("xywh={region}"),
            Selector::Choice(selectors) => return selectors.iter().find_map(Selector::fragment),
            Selector::Unsupported => return None,
        };
        (!fragment.is_empty()).then_some(fragment)
    }
}

fn encode_opt(part: &Option<String>) -> String {
    part.as_deref()
        .map(|p| urlencoding::encode(p).into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Literal(String),
    /// An object with an `id`; any selector beside it is ignored.
    Id(String),
    SourceSelector {
        source: String,
        selector: Option<Selector>,
    },
    Value(String),
    List(Vec<Target>),
    Unrecognized,
}

impl Target {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Target::Literal(s.clone()),
            Value::Array(items) => Target::List(items.iter().map(Target::from_value).collect()),
            Value::Object(map) => {
                if let Some(id) = json::id_of(value) {
                    return Target::Id(id.to_owned());
                }
                if let Some(source) = map.get("source") {
                    return match json::ref_id(source) {
                        Some(source) => Target::SourceSelector {
                            source: source.to_owned(),
                            selector: map.get("selector").map(Selector::from_value),
                        },
                        None => Target::Unrecognized,
                    };
                }
                match map.get("value").and_then(Value::as_str) {
                    Some(text) => Target::Value(text.to_owned()),
                    None => Target::Unrecognized,
                }
            }
            _ => Target::Unrecognized,
        }
    }

    /// Flattens depth-first, preserving encounter order.
    pub fn normalize(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }

    fn collect_into(&self, out: &mut Vec<String>) {
        match self {
            Target::Literal(s) | Target::Id(s) | Target::Value(s) => out.push(s.clone()),
            Target::SourceSelector { source, selector } => {
                match selector.as_ref().and_then(Selector::fragment) {
                    Some(fragment) => out.push(format!("{}#{fragment}", strip_fragment(source))),
                    None => out.push(source.clone()),
                }
            }
            Target::List(targets) => {
                for target in targets {
                    target.collect_into(out);
                }
            }
            Target::Unrecognized => {}
        }
    }
}

pub fn normalize_target(target: &Value) -> Vec<String> {
    Target::from_value(target).normalize()
}

pub fn extract_selector(selector: &Value) -> Option<String> {
    Selector::from_value(selector).fragment()
}
