//! Rule documents as they cross between Kibana and Git.
//!
//! A rule's stable id is its `rule_id`, or its Kibana `id` when `rule_id` is
//! missing. On disk every rule lives in `{encoded stable id}.json`; the
//! encoding is reversible so deletion candidates can be computed from a
//! directory listing alone.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Fields that only mean something inside the system that produced them.
pub const READ_ONLY_FIELDS: &[&str] = &["id", "created_at", "updated_at", "created_by", "updated_by"];

/// Fields Kibana computes itself and rejects on create/update.
pub const SERVER_MANAGED_FIELDS: &[&str] = &["revision", "immutable", "execution_summary", "rule_source"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleParseError {
    #[error("rule document is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("rule document is not a JSON object")]
    NotAnObject,
    #[error("rule document has neither rule_id nor id")]
    MissingStableId,
}

/// Which field the stable id was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdField {
    RuleId,
    /// Kibana's own `id`; the rule has no `rule_id`.
    Id,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleRecord {
    pub stable_id: String,
    pub id_field: IdField,
    pub display_name: String,
    pub payload: Value,
}

/// String value of `key`, unless it is blank. The value is returned as stored.
fn non_empty_str<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

impl RuleRecord {
    /// Builds a record from a Kibana rule document.
    pub fn from_value(payload: Value) -> Result<Self, RuleParseError> {
        let map = payload.as_object().ok_or(RuleParseError::NotAnObject)?;
        let (stable_id, id_field) = match non_empty_str(map, "rule_id") {
            Some(rule_id) => (rule_id.to_string(), IdField::RuleId),
            None => (
                non_empty_str(map, "id").ok_or(RuleParseError::MissingStableId)?.to_string(),
                IdField::Id,
            ),
        };
        let display_name = non_empty_str(map, "name").unwrap_or(&stable_id).to_string();
        Ok(RuleRecord {
            stable_id,
            id_field,
            display_name,
            payload,
        })
    }

    /// Builds a record from a rule file. The id encoded in the filename is
    /// authoritative and overrides whatever `rule_id` the content carries.
    pub fn from_file(stable_id: &str, content: &[u8]) -> Result<Self, RuleParseError> {
        let mut payload: Value =
            serde_json::from_slice(content).map_err(|e| RuleParseError::InvalidJson(e.to_string()))?;
        let map = payload.as_object_mut().ok_or(RuleParseError::NotAnObject)?;
        if let Some(existing) = non_empty_str(map, "rule_id") {
            if existing != stable_id {
                tracing::warn!(
                    file_id = stable_id,
                    content_id = existing,
                    "rule_id in file content differs from filename; filename wins"
                );
            }
        }
        map.insert("rule_id".to_string(), Value::String(stable_id.to_string()));
        RuleRecord::from_value(payload)
    }

    /// Payload safe to send to the opposite system.
    pub fn outbound_payload(&self) -> Value {
        let mut payload = self.payload.clone();
        if let Some(map) = payload.as_object_mut() {
            for field in READ_ONLY_FIELDS.iter().chain(SERVER_MANAGED_FIELDS) {
                map.remove(*field);
            }
            map.insert("rule_id".to_string(), Value::String(self.stable_id.clone()));
        }
        payload
    }

    /// Canonical file bytes: stripped payload, sorted keys, pretty-printed, trailing newline.
    pub fn render_file(&self) -> Vec<u8> {
        // serde_json's default Map is a BTreeMap, so keys come out sorted.
        let mut bytes = serde_json::to_vec_pretty(&self.outbound_payload()).unwrap_or_default();
        bytes.push(b'\n');
        bytes
    }
}

/// Hex SHA-256 of `bytes`, used to compare rendered rule content.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

/// Filename-safe encoding of a stable id: `[A-Za-z0-9_-]` pass through, every
/// other byte becomes `%HH`.
pub fn encode_stable_id(stable_id: &str) -> String {
    let mut out = String::with_capacity(stable_id.len());
    for byte in stable_id.bytes() {
        if is_plain(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Inverse of [`encode_stable_id`]. `None` for anything the encoder could not have produced.
pub fn decode_stable_id(encoded: &str) -> Option<String> {
    let raw = encoded.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'%' => {
                let hex = encoded.get(i + 1..i + 3)?;
                if !hex.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b)) {
                    return None;
                }
                let byte = u8::from_str_radix(hex, 16).ok()?;
                if is_plain(byte) {
                    return None;
                }
                bytes.push(byte);
                i += 3;
            }
            b if is_plain(b) => {
                bytes.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    let decoded = String::from_utf8(bytes).ok()?;
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

pub fn file_name_for(stable_id: &str) -> String {
    format!("{}.json", encode_stable_id(stable_id))
}

/// Repository path of the rule file, under `base_path` when one is configured.
pub fn path_for(base_path: &str, stable_id: &str) -> String {
    let base = base_path.trim_matches('/');
    if base.is_empty() {
        file_name_for(stable_id)
    } else {
        format!("{}/{}", base, file_name_for(stable_id))
    }
}

/// Stable id encoded in a rule file path, `None` for non-rule files.
pub fn stable_id_from_path(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let stem = name.strip_suffix(".json")?;
    decode_stable_id(stem)
}
