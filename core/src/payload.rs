//! Callback payload normalization: pick a payload shape from Content-Type, then reduce the raw
//! body to a JSON value. Query strings are flattened to a string map.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Payload shapes the callback endpoint knows how to normalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// `application/json` or any `+json` structured suffix.
    Json,
    /// `application/x-www-form-urlencoded`.
    Form,
    /// Anything else, including a missing header. Passed through untransformed.
    Other,
}

impl PayloadKind {
    /// Classify by media type essence; parameters (`; charset=...`) and case are ignored.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(ct) = content_type else {
            return PayloadKind::Other;
        };
        let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "application/json" => PayloadKind::Json,
            "application/x-www-form-urlencoded" => PayloadKind::Form,
            s if s.ends_with("+json") && s.contains('/') => PayloadKind::Json,
            _ => PayloadKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Json => "json",
            PayloadKind::Form => "form",
            PayloadKind::Other => "other",
        }
    }
}

/// Side note produced while normalizing; the endpoint turns it into a log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    /// Form body was converted to a JSON object.
    Converted { fields: usize },
    /// Body did not parse under the declared type; an empty object was used instead.
    Malformed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub body: Value,
    pub note: Option<Note>,
}

/// Reduce a raw body to JSON according to its payload kind.
pub fn normalize(kind: PayloadKind, raw: &[u8]) -> Normalized {
    match kind {
        PayloadKind::Json => normalize_json(raw),
        PayloadKind::Form => {
            let body = form_to_json(raw);
            let fields = body.as_object().map(|m| m.len()).unwrap_or(0);
            Normalized {
                body,
                note: Some(Note::Converted { fields }),
            }
        }
        PayloadKind::Other => Normalized {
            body: if raw.is_empty() {
                Value::Null
            } else {
                Value::String(String::from_utf8_lossy(raw).into_owned())
            },
            note: None,
        },
    }
}

fn normalize_json(raw: &[u8]) -> Normalized {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Normalized {
            body: Value::Object(Map::new()),
            note: Some(Note::Malformed {
                reason: "empty JSON body".to_string(),
            }),
        };
    }
    match serde_json::from_slice::<Value>(raw) {
        Ok(body) => Normalized { body, note: None },
        Err(e) => Normalized {
            body: Value::Object(Map::new()),
            note: Some(Note::Malformed {
                reason: format!("invalid JSON body: {}", e),
            }),
        },
    }
}

/// Decode `a=1&b=two` into `{"a":"1","b":"two"}`. A key repeated in the body becomes an array.
pub fn form_to_json(raw: &[u8]) -> Value {
    let mut map = Map::new();
    for (k, v) in url::form_urlencoded::parse(raw) {
        let v = Value::String(v.into_owned());
        match map.get_mut(&*k) {
            Some(Value::Array(items)) => items.push(v),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, v]);
            }
            None => {
                map.insert(k.into_owned(), v);
            }
        }
    }
    Value::Object(map)
}

/// Flat query-string mapping. For repeated keys the last value wins.
pub fn parse_query(query: Option<&str>) -> BTreeMap<String, String> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}
