//! Channel message decoding
//!
//! Every message on the push channel is a JSON object. Three shapes exist:
//! `{type:"ping"}`, `{type:"heartbeat"}`, and the general stage event
//! `{stage, status, message, ...payload}`. Payload keys differ per stage, so
//! the payload is decoded once here into a [`StagePayload`] variant and
//! downstream code matches on the variant instead of probing for keys.
//!
//! Keys that are not part of a stage's payload are kept in
//! [`StageEvent::extra`] untouched.

use crate::{Error, Result};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Categories in arrival order, each with its items
pub type CategoryItems = Vec<(String, Vec<MenuItem>)>;

/// Status reported for a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    #[serde(alias = "processing", alias = "in_progress", alias = "running")]
    Active,
    #[serde(alias = "complete", alias = "done")]
    Completed,
    #[serde(alias = "failed")]
    Error,
}

impl StageStatus {
    /// Ordering used to avoid regressing a stage record (error ranks like completed:
    /// both are final for the stage)
    pub fn rank(&self) -> u8 {
        match self {
            StageStatus::Pending => 0,
            StageStatus::Active => 1,
            StageStatus::Completed | StageStatus::Error => 2,
        }
    }
}

/// One menu item as the pipeline sends it
///
/// Producers name the same field differently; when several synonyms are
/// present the first non-null one in [`MenuItem::SYNONYMS`] order wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct MenuItem {
    pub id: Option<String>,
    pub source_text: String,
    pub translated_text: Option<String>,
    pub description: Option<String>,
    pub price: Option<String>,
    pub image_url: Option<String>,
}

impl MenuItem {
    pub const SYNONYMS: &'static [&'static [&'static str]] = &[
        &["source_text", "japanese_name", "original_name", "original"],
        &["translated_text", "english_name", "translation", "name"],
        &["image_url", "image"],
    ];
}

#[derive(Deserialize)]
struct MenuItemFields {
    #[serde(default, deserialize_with = "de_opt_stringish")]
    id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_stringish")]
    source_text: Option<String>,
    #[serde(default, deserialize_with = "de_opt_stringish")]
    translated_text: Option<String>,
    #[serde(default, deserialize_with = "de_opt_stringish")]
    description: Option<String>,
    #[serde(default, deserialize_with = "de_opt_stringish")]
    price: Option<String>,
    #[serde(default, deserialize_with = "de_opt_stringish")]
    image_url: Option<String>,
}

impl TryFrom<Map<String, Value>> for MenuItem {
    type Error = serde_json::Error;

    fn try_from(mut map: Map<String, Value>) -> std::result::Result<Self, Self::Error> {
        for keys in MenuItem::SYNONYMS {
            coalesce(&mut map, keys);
        }
        let fields: MenuItemFields = serde_json::from_value(Value::Object(map))?;
        Ok(MenuItem {
            id: fields.id,
            source_text: fields.source_text.unwrap_or_default(),
            translated_text: fields.translated_text,
            description: fields.description,
            price: fields.price,
            image_url: fields.image_url,
        })
    }
}

/// Image lookup result for one dish name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct ImageEntry {
    pub name: String,
    pub image_url: String,
}

impl ImageEntry {
    pub const SYNONYMS: &'static [&'static [&'static str]] = &[
        &["name", "english_name", "item_name", "dish"],
        &["image_url", "url"],
    ];
}

#[derive(Deserialize)]
struct ImageEntryFields {
    name: String,
    image_url: String,
}

impl TryFrom<Map<String, Value>> for ImageEntry {
    type Error = serde_json::Error;

    fn try_from(mut map: Map<String, Value>) -> std::result::Result<Self, Self::Error> {
        for keys in ImageEntry::SYNONYMS {
            coalesce(&mut map, keys);
        }
        let fields: ImageEntryFields = serde_json::from_value(Value::Object(map))?;
        Ok(ImageEntry {
            name: fields.name,
            image_url: fields.image_url,
        })
    }
}

/// Keep the first non-null value among `keys` under `keys[0]`; drop the rest
fn coalesce(map: &mut Map<String, Value>, keys: &[&str]) {
    let mut chosen = None;
    for key in keys {
        match map.remove(*key) {
            Some(v) if chosen.is_none() && !v.is_null() => chosen = Some(v),
            _ => {}
        }
    }
    if let Some(v) = chosen {
        map.insert(keys[0].to_string(), v);
    }
}

/// Stage-4 payload; any combination of the fields may be present and they
/// are applied in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentPayload {
    pub processing_category: Option<String>,
    /// Items to append to the processing category's partial bucket
    pub chunk_result: Option<Vec<MenuItem>>,
    /// Category named inside the chunk itself, overriding the pointer
    pub chunk_category: Option<String>,
    pub category_completed: Option<String>,
    pub completed_category_items: Option<Vec<MenuItem>>,
    pub final_menu: Option<CategoryItems>,
}

impl EnrichmentPayload {
    pub fn is_empty(&self) -> bool {
        self == &EnrichmentPayload::default()
    }
}

/// Decoded, stage-specific payload
#[derive(Debug, Clone, PartialEq)]
pub enum StagePayload {
    /// Stage 1
    Ocr { text: Option<String> },
    /// Stage 2
    Categorized { categories: CategoryItems },
    /// Stage 3
    Translated { categories: CategoryItems },
    /// Stage 4
    Enrichment(EnrichmentPayload),
    /// Stage 5
    Images {
        images: Vec<(String, Vec<ImageEntry>)>,
        final_menu: Option<CategoryItems>,
    },
    /// Stage 6
    Completed { final_menu: Option<CategoryItems> },
}

/// General stage event
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvent {
    pub stage: u8,
    pub status: StageStatus,
    pub message: String,
    pub payload: StagePayload,
    /// Unrecognized top-level keys, passed through untouched
    pub extra: Map<String, Value>,
}

impl StageEvent {
    /// Event with an empty payload for `stage`
    pub fn bare(stage: u8, status: StageStatus, message: impl Into<String>) -> Self {
        let payload = match stage {
            1 => StagePayload::Ocr { text: None },
            2 => StagePayload::Categorized { categories: Vec::new() },
            3 => StagePayload::Translated { categories: Vec::new() },
            4 => StagePayload::Enrichment(EnrichmentPayload::default()),
            5 => StagePayload::Images { images: Vec::new(), final_menu: None },
            _ => StagePayload::Completed { final_menu: None },
        };
        Self {
            stage,
            status,
            message: message.into(),
            payload,
            extra: Map::new(),
        }
    }
}

/// Anything that can arrive on the push channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// Keep-alive that must be answered with a pong call
    Ping,
    /// Keep-alive that needs no answer
    Heartbeat,
    Stage(StageEvent),
}

/// Decode one raw channel message.
///
/// Returns `Error::Parse` for anything that is not a recognizable message;
/// callers log and skip those.
pub fn decode_message(raw: &str) -> Result<ChannelMessage> {
    let value: Value = serde_json::from_str(raw.trim())
        .map_err(|e| Error::Parse(format!("invalid JSON: {}", e)))?;
    let Value::Object(mut obj) = value else {
        return Err(Error::Parse("message is not a JSON object".to_string()));
    };

    match obj.get("type").and_then(Value::as_str) {
        Some("ping") => return Ok(ChannelMessage::Ping),
        Some("heartbeat") => return Ok(ChannelMessage::Heartbeat),
        _ => {}
    }

    let stage = obj
        .remove("stage")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::Parse("missing integer 'stage'".to_string()))?;
    if !(1..=6).contains(&stage) {
        return Err(Error::Parse(format!("stage {} out of range 1-6", stage)));
    }
    let stage = stage as u8;

    let status: StageStatus = match obj.remove("status") {
        Some(v) => serde_json::from_value(v)
            .map_err(|e| Error::Parse(format!("invalid status: {}", e)))?,
        None => return Err(Error::Parse("missing 'status'".to_string())),
    };
    let message = match obj.remove("message") {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    let payload = decode_payload(stage, &mut obj)?;

    Ok(ChannelMessage::Stage(StageEvent {
        stage,
        status,
        message,
        payload,
        extra: obj,
    }))
}

fn decode_payload(stage: u8, obj: &mut Map<String, Value>) -> Result<StagePayload> {
    let payload = match stage {
        1 => StagePayload::Ocr {
            text: take::<String>(obj, "ocr_text")?,
        },
        2 => StagePayload::Categorized {
            categories: take_categories(obj, "categories")?.unwrap_or_default(),
        },
        3 => StagePayload::Translated {
            categories: take_categories(obj, "translated_categories")?.unwrap_or_default(),
        },
        4 => {
            let processing_category = take::<String>(obj, "processing_category")?;
            let (chunk_result, chunk_category) = match obj.remove("chunk_result") {
                None | Some(Value::Null) => (None, None),
                Some(Value::Array(items)) => (Some(items_from_values(items)?), None),
                Some(Value::Object(mut chunk)) => {
                    let category = take::<String>(&mut chunk, "category")?;
                    let items = take::<Vec<MenuItem>>(&mut chunk, "items")?.unwrap_or_default();
                    (Some(items), category)
                }
                Some(other) => {
                    return Err(Error::Parse(format!(
                        "chunk_result must be an array or object, got {}",
                        other
                    )))
                }
            };
            StagePayload::Enrichment(EnrichmentPayload {
                processing_category,
                chunk_result,
                chunk_category,
                category_completed: take::<String>(obj, "category_completed")?,
                completed_category_items: take::<Vec<MenuItem>>(obj, "completed_category_items")?,
                final_menu: take_categories(obj, "final_menu")?,
            })
        }
        5 => StagePayload::Images {
            images: take_images(obj, "images_generated")?.unwrap_or_default(),
            final_menu: take_categories(obj, "final_menu")?,
        },
        _ => StagePayload::Completed {
            final_menu: take_categories(obj, "final_menu")?,
        },
    };
    Ok(payload)
}

/// Remove `key` and decode it; `null` and absence both yield `None`
fn take<T: DeserializeOwned>(obj: &mut Map<String, Value>, key: &str) -> Result<Option<T>> {
    match obj.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|e| Error::Parse(format!("invalid '{}': {}", key, e))),
    }
}

fn items_from_values(values: Vec<Value>) -> Result<Vec<MenuItem>> {
    values
        .into_iter()
        .map(|v| {
            serde_json::from_value(v).map_err(|e| Error::Parse(format!("invalid item: {}", e)))
        })
        .collect()
}

fn take_categories(obj: &mut Map<String, Value>, key: &str) -> Result<Option<CategoryItems>> {
    match obj.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => {
            let mut categories = Vec::with_capacity(map.len());
            for (name, items) in map {
                let items = match items {
                    Value::Array(values) => items_from_values(values)?,
                    Value::Null => Vec::new(),
                    other => {
                        return Err(Error::Parse(format!(
                            "category '{}' in '{}' is not a list: {}",
                            name, key, other
                        )))
                    }
                };
                categories.push((name, items));
            }
            Ok(Some(categories))
        }
        Some(other) => Err(Error::Parse(format!(
            "'{}' must be an object keyed by category, got {}",
            key, other
        ))),
    }
}

/// Accepts `{category: [{name, image_url}]}` or `{category: {name: url}}`
fn take_images(
    obj: &mut Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<(String, Vec<ImageEntry>)>>> {
    match obj.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => {
            let mut out = Vec::with_capacity(map.len());
            for (category, entries) in map {
                let entries = match entries {
                    Value::Array(values) => values
                        .into_iter()
                        .map(|v| {
                            serde_json::from_value::<ImageEntry>(v).map_err(|e| {
                                Error::Parse(format!("invalid image entry: {}", e))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                    Value::Object(by_name) => by_name
                        .into_iter()
                        .filter_map(|(name, url)| {
                            url.as_str().map(|u| ImageEntry {
                                name,
                                image_url: u.to_string(),
                            })
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                out.push((category, entries));
            }
            Ok(Some(out))
        }
        Some(other) => Err(Error::Parse(format!(
            "'{}' must be an object keyed by category, got {}",
            key, other
        ))),
    }
}

/// Accepts strings and numbers (ids and prices arrive as either)
fn de_opt_stringish<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}
