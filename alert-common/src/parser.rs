//! Turn frame payloads into `Event`s.
//!
//! The device sends `EventNotificationAlert` documents, as XML on most firmware and as JSON on
//! newer intercom firmware. The field set varies by model and firmware, so both formats are
//! flattened into leaves and fields are looked up by name wherever they appear. Anything we don't
//! know about is carried into the payload digest and otherwise ignored.
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::event::{Event, EventKind, PayloadDigest};
use crate::multipart::Frame;

/// Channel used when the payload names none.
pub const DEFAULT_CHANNEL: u32 = 1;

const CHANNEL_FIELDS: &[&str] = &[
    "channelID",
    "dynChannelID",
    "channelId",
    "videoInputChannelID",
];

/// Fields that change on every repeated post of the same alarm, left out of the digest.
const VOLATILE_FIELDS: &[&str] = &["dateTime", "activePostCount", "time"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("frame has an empty body")]
    Empty,
    #[error("frame body is not valid UTF-8")]
    NotUtf8,
    #[error("frame body is not well-formed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Leaf {
    path: String,
    name: String,
    depth: usize,
    value: String,
}

/// Parse a frame received at `received_at` into an `Event`.
pub fn parse(frame: &Frame, received_at: DateTime<Utc>) -> Result<Event, ParseFailure> {
    let body = std::str::from_utf8(frame.body()).map_err(|_| ParseFailure::NotUtf8)?;
    let body = body.trim_start_matches('\u{feff}').trim();
    if body.is_empty() {
        return Err(ParseFailure::Empty);
    }

    let leaves = if is_json(frame.content_type(), body) {
        json_leaves(body)?
    } else {
        xml_leaves(body)?
    };

    let kind = field(&leaves, "eventType")
        .map(EventKind::from_event_type)
        .unwrap_or_else(|| EventKind::Unknown(String::new()));

    let channel = CHANNEL_FIELDS
        .iter()
        .filter_map(|name| field(&leaves, name))
        .find_map(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(DEFAULT_CHANNEL);

    let (occurred_at, time_substituted) = match field(&leaves, "dateTime").and_then(parse_timestamp)
    {
        Some(occurred_at) => (occurred_at, false),
        None => (received_at, true),
    };

    let sequence = field(&leaves, "serialNo").and_then(|value| value.trim().parse::<u64>().ok());

    let active = field(&leaves, "eventState")
        .map(|state| !state.trim().eq_ignore_ascii_case("inactive"))
        .unwrap_or(true);

    let description = field(&leaves, "eventDescription")
        .map(str::trim)
        .filter(|description| !description.is_empty())
        .map(str::to_owned);

    Ok(Event::new(kind, channel, occurred_at, digest(&leaves))
        .time_substituted(time_substituted)
        .sequence(sequence)
        .active(active)
        .description(description))
}

fn is_json(content_type: Option<&str>, body: &str) -> bool {
    match content_type {
        Some(content_type) if content_type.to_ascii_lowercase().contains("json") => true,
        Some(content_type) if content_type.to_ascii_lowercase().contains("xml") => false,
        _ => body.starts_with('{'),
    }
}

/// Value of the shallowest leaf called `name`.
fn field<'a>(leaves: &'a [Leaf], name: &str) -> Option<&'a str> {
    leaves
        .iter()
        .filter(|leaf| leaf.name.eq_ignore_ascii_case(name))
        .min_by_key(|leaf| leaf.depth)
        .map(|leaf| leaf.value.as_str())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    // Some firmware drops the UTC offset; there is nothing better to assume than UTC.
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn digest(leaves: &[Leaf]) -> PayloadDigest {
    let mut canonical: Vec<(&str, &str)> = leaves
        .iter()
        .filter(|leaf| {
            !VOLATILE_FIELDS
                .iter()
                .any(|volatile| leaf.name.eq_ignore_ascii_case(volatile))
        })
        .map(|leaf| (leaf.path.as_str(), leaf.value.trim()))
        .collect();
    canonical.sort_unstable();

    let mut hasher = Sha256::new();
    for (path, value) in canonical {
        hasher.update(path.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    PayloadDigest(hasher.finalize().into())
}

fn xml_leaves(body: &str) -> Result<Vec<Leaf>, ParseFailure> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut text: Option<String> = None;
    let mut leaves = Vec::new();
    let mut root_closed = false;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(start)) => {
                if root_closed {
                    return Err(ParseFailure::Malformed(
                        "more than one root element".to_owned(),
                    ));
                }
                path.push(String::from_utf8_lossy(start.local_name().as_ref()).into_owned());
                text = None;
            }
            Ok(XmlEvent::Empty(empty)) => {
                if root_closed {
                    return Err(ParseFailure::Malformed(
                        "more than one root element".to_owned(),
                    ));
                }
                let name = String::from_utf8_lossy(empty.local_name().as_ref()).into_owned();
                path.push(name);
                push_leaf(&mut leaves, &path, String::new());
                path.pop();
                root_closed = path.is_empty();
            }
            Ok(XmlEvent::Text(content)) => {
                if path.is_empty() {
                    return Err(ParseFailure::Malformed(
                        "text outside of the root element".to_owned(),
                    ));
                }
                let content = content
                    .unescape()
                    .map_err(|e| ParseFailure::Malformed(e.to_string()))?;
                text.get_or_insert_with(String::new).push_str(&content);
            }
            Ok(XmlEvent::CData(content)) => {
                let content = String::from_utf8_lossy(&content.into_inner()).into_owned();
                text.get_or_insert_with(String::new).push_str(&content);
            }
            Ok(XmlEvent::End(_)) => {
                if path.is_empty() {
                    return Err(ParseFailure::Malformed("unbalanced end tag".to_owned()));
                }
                if let Some(value) = text.take() {
                    push_leaf(&mut leaves, &path, value);
                }
                path.pop();
                root_closed = path.is_empty();
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ParseFailure::Malformed(e.to_string())),
        }
    }

    if !path.is_empty() {
        return Err(ParseFailure::Malformed(format!(
            "unclosed element <{}>",
            path.join("/")
        )));
    }
    if !root_closed {
        return Err(ParseFailure::Malformed("no root element".to_owned()));
    }

    Ok(leaves)
}

fn push_leaf(leaves: &mut Vec<Leaf>, path: &[String], value: String) {
    leaves.push(Leaf {
        path: path.join("/"),
        name: path.last().cloned().unwrap_or_default(),
        depth: path.len(),
        value,
    });
}

fn json_leaves(body: &str) -> Result<Vec<Leaf>, ParseFailure> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| ParseFailure::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ParseFailure::Malformed(
            "JSON payload is not an object".to_owned(),
        ));
    }

    let mut leaves = Vec::new();
    let mut path = Vec::new();
    flatten_json(&value, &mut path, &mut leaves);
    Ok(leaves)
}

fn flatten_json(value: &serde_json::Value, path: &mut Vec<String>, leaves: &mut Vec<Leaf>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                path.push(key.to_owned());
                flatten_json(value, path, leaves);
                path.pop();
            }
        }
        serde_json::Value::Array(items) => {
            // Array items keep the name of the array so lookups by field name still work.
            for item in items {
                flatten_json(item, path, leaves);
            }
        }
        serde_json::Value::Null => {}
        serde_json::Value::String(s) => push_leaf(leaves, path, s.to_owned()),
        scalar => push_leaf(leaves, path, scalar.to_string()),
    }
}
