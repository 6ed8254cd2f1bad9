//! Export archive parsing and linearization.
//!
//! Consumes the official chat-history export: a ZIP containing a
//! `conversations.json` file (a plain `conversations.json` path is also
//! accepted). Each record holds a tree of message nodes; this module collapses
//! the tree into a linear, turn-indexed sequence.
//!
//! # Linearization
//!
//! The export marks one leaf with `current_node`. When that pointer names a
//! known node, the chosen path is the parent chain from that leaf back to the
//! root, reversed. Without it, the walk starts at the root and at every node
//! picks the child with the latest timestamp, tie-broken by the
//! lexicographically smallest child id. Nodes without a message payload are
//! dropped; system turns with empty flattened content are dropped; tool turns
//! are kept. `turn_index` is dense over the retained nodes.
//!
//! # Identity
//!
//! `raw_hash` is SHA-256 over the canonical serialization of the source
//! record (sorted keys, compact). Ingestion uses it to skip records that were
//! already imported.

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use thiserror::Error;

use crate::models::Role;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("no conversations.json found in archive")]
    MissingConversations,
    #[error("conversations.json root must be an array of conversation records")]
    NotAnArray,
    #[error("failed to read archive: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON in conversations.json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("malformed conversation record: {0}")]
    Malformed(String),
}

/// A conversation after linearization, ready for persistence.
#[derive(Debug, Clone)]
pub struct ParsedConversation {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub default_model_slug: Option<String>,
    pub gizmo_id: Option<String>,
    pub gizmo_type: Option<String>,
    pub raw_hash: String,
    /// Unknown source fields, preserved but not indexed.
    pub meta_json: String,
    pub messages: Vec<ParsedMessage>,
}

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub id: String,
    pub parent_id: Option<String>,
    pub role: Role,
    pub content_type: String,
    pub content_text: String,
    pub created_at: i64,
    pub turn_index: i64,
    pub text_hash: String,
}

#[derive(Debug, Deserialize)]
struct RawConversation {
    id: Option<String>,
    conversation_id: Option<String>,
    title: Option<String>,
    create_time: Option<f64>,
    update_time: Option<f64>,
    default_model_slug: Option<String>,
    gizmo_id: Option<String>,
    gizmo_type: Option<String>,
    current_node: Option<String>,
    #[serde(default)]
    mapping: HashMap<String, RawNode>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    parent: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    children: Vec<String>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: Option<String>,
    author: Option<RawAuthor>,
    create_time: Option<f64>,
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawAuthor {
    role: Option<String>,
}

/// Read the conversation records from an export ZIP or a bare
/// `conversations.json` file.
pub fn read_conversations(path: &Path) -> Result<Vec<Value>, ArchiveError> {
    let raw = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        std::fs::read_to_string(path)?
    } else {
        read_from_zip(path)?
    };

    let root: Value = serde_json::from_str(&raw)?;
    match root {
        Value::Array(records) => Ok(records),
        // Some exports wrap a single conversation without the list.
        Value::Object(_) => Ok(vec![root]),
        _ => Err(ArchiveError::NotAnArray),
    }
}

fn read_from_zip(path: &Path) -> Result<String, ArchiveError> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut candidates: Vec<String> = archive
        .file_names()
        .filter(|n| n.ends_with("conversations.json"))
        .map(|n| n.to_string())
        .collect();
    if candidates.is_empty() {
        return Err(ArchiveError::MissingConversations);
    }
    // Prefer the shallowest entry.
    candidates.sort_by(|a, b| (a.len(), a.as_str()).cmp(&(b.len(), b.as_str())));

    let mut entry = archive.by_name(&candidates[0])?;
    let mut raw = String::new();
    entry.read_to_string(&mut raw)?;
    Ok(raw)
}

/// Canonical digest of a source record: compact JSON with sorted keys.
pub fn raw_hash(record: &Value) -> String {
    // serde_json maps are ordered by key, so to_string is already canonical.
    let canonical = serde_json::to_string(record).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parse one conversation record into its linearized form.
pub fn parse_record(record: &Value) -> Result<ParsedConversation, ArchiveError> {
    let hash = raw_hash(record);
    let raw: RawConversation = serde_json::from_value(record.clone())
        .map_err(|e| ArchiveError::Malformed(e.to_string()))?;

    let id = raw
        .id
        .or(raw.conversation_id)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| hash[..32].to_string());

    let title = raw
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    let created_at = raw.create_time.map(|t| t as i64).unwrap_or(0);
    let updated_at = raw.update_time.map(|t| t as i64).unwrap_or(created_at);

    let path = linearize(&raw.mapping, raw.current_node.as_deref());

    let mut messages = Vec::new();
    for node_id in &path {
        let node = &raw.mapping[node_id];
        let msg = match &node.message {
            Some(m) => m,
            None => continue,
        };

        let role = Role::parse(
            msg.author
                .as_ref()
                .and_then(|a| a.role.as_deref())
                .unwrap_or("unknown"),
        );
        let (content_type, content_text) = flatten_content(msg.content.as_ref());

        if role == Role::System && content_text.is_empty() {
            continue;
        }

        let turn_index = messages.len() as i64;
        messages.push(ParsedMessage {
            id: msg
                .id
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| node_id.clone()),
            parent_id: node.parent.clone(),
            role,
            content_type,
            text_hash: text_hash(&content_text),
            content_text,
            created_at: msg.create_time.map(|t| t as i64).unwrap_or(0),
            turn_index,
        });
    }

    Ok(ParsedConversation {
        id,
        title,
        created_at,
        updated_at,
        default_model_slug: raw.default_model_slug,
        gizmo_id: raw.gizmo_id,
        gizmo_type: raw.gizmo_type,
        raw_hash: hash,
        meta_json: serde_json::to_string(&raw.extra).unwrap_or_else(|_| "{}".to_string()),
        messages,
    })
}

/// Select the root-to-leaf path through the message tree. Returns node ids in
/// turn order; an empty mapping yields an empty path.
fn linearize(mapping: &HashMap<String, RawNode>, current_node: Option<&str>) -> Vec<String> {
    if mapping.is_empty() {
        return Vec::new();
    }

    // The current_node hint wins: walk the parent chain up, then reverse.
    if let Some(leaf) = current_node {
        if mapping.contains_key(leaf) {
            let mut path = Vec::new();
            let mut seen = HashSet::new();
            let mut cursor = Some(leaf.to_string());
            while let Some(node_id) = cursor {
                if !seen.insert(node_id.clone()) {
                    break; // cycle guard
                }
                cursor = mapping.get(&node_id).and_then(|n| n.parent.clone());
                path.push(node_id);
            }
            path.reverse();
            return path;
        }
    }

    // Otherwise walk down from the root, preferring the child with the latest
    // timestamp; ties go to the lexicographically smallest id.
    let mut roots: Vec<&String> = mapping
        .iter()
        .filter(|(_, n)| n.parent.is_none())
        .map(|(id, _)| id)
        .collect();
    roots.sort();
    let root = match roots.first() {
        Some(r) => (*r).clone(),
        None => return Vec::new(),
    };

    let mut children_of: HashMap<&str, Vec<&String>> = HashMap::new();
    for (id, node) in mapping {
        if let Some(parent) = &node.parent {
            children_of.entry(parent.as_str()).or_default().push(id);
        }
    }

    let mut path = vec![root.clone()];
    let mut seen: HashSet<String> = path.iter().cloned().collect();
    let mut cursor = root;
    loop {
        let mut best: Option<(&String, f64)> = None;
        if let Some(kids) = children_of.get(cursor.as_str()) {
            for kid in kids {
                if seen.contains(*kid) {
                    continue;
                }
                let ts = node_timestamp(mapping, kid);
                // Latest timestamp wins; ties go to the smallest id.
                let better = match best {
                    None => true,
                    Some((best_id, best_ts)) => {
                        ts > best_ts || (ts == best_ts && kid.as_str() < best_id.as_str())
                    }
                };
                if better {
                    best = Some((kid, ts));
                }
            }
        }
        match best {
            Some((child, _)) => {
                let child = child.clone();
                seen.insert(child.clone());
                path.push(child.clone());
                cursor = child;
            }
            None => break,
        }
    }
    path
}

fn node_timestamp(mapping: &HashMap<String, RawNode>, id: &str) -> f64 {
    mapping
        .get(id)
        .and_then(|n| n.message.as_ref())
        .and_then(|m| m.create_time)
        .unwrap_or(0.0)
}

/// Flatten a node's content parts into `(content_type, text)`.
///
/// Parts are joined with one blank line. Non-text parts are rendered as
/// `[content_type: <kind>]` followed by any text payload. Trailing whitespace
/// is trimmed per line.
fn flatten_content(content: Option<&Value>) -> (String, String) {
    let content = match content {
        Some(c) => c,
        None => return ("text".to_string(), String::new()),
    };

    let content_type = content
        .get("content_type")
        .and_then(|v| v.as_str())
        .unwrap_or("text")
        .to_string();

    let mut blocks: Vec<String> = Vec::new();

    if let Some(parts) = content.get("parts").and_then(|v| v.as_array()) {
        for part in parts {
            match part {
                Value::String(s) => {
                    if !s.trim().is_empty() {
                        blocks.push(s.clone());
                    }
                }
                Value::Object(obj) => {
                    let kind = obj
                        .get("content_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    let payload = part_payload(part);
                    match payload {
                        Some(text) => blocks.push(format!("[content_type: {}]\n{}", kind, text)),
                        None => blocks.push(format!("[content_type: {}]", kind)),
                    }
                }
                _ => {}
            }
        }
    } else if let Some(text) = part_payload(content) {
        if content_type == "text" {
            blocks.push(text);
        } else {
            blocks.push(format!("[content_type: {}]\n{}", content_type, text));
        }
    }

    let joined = blocks.join("\n\n");
    let trimmed = joined
        .split('\n')
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    (content_type, trimmed.trim_end().to_string())
}

/// Text payload of a content object, checking the field names the export uses.
fn part_payload(value: &Value) -> Option<String> {
    for key in ["text", "result", "value"] {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            if !s.trim().is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(parent: Option<&str>, role: &str, text: &str, ts: f64) -> Value {
        json!({
            "parent": parent,
            "children": [],
            "message": {
                "id": format!("msg-{}", text.replace(' ', "-")),
                "author": {"role": role},
                "create_time": ts,
                "content": {"content_type": "text", "parts": [text]}
            }
        })
    }

    #[test]
    fn follows_current_node_hint() {
        // root → A → leaf is marked current; B is the newer sibling but must
        // not be persisted.
        let record = json!({
            "id": "conv-1",
            "title": "Branching",
            "create_time": 10.0,
            "update_time": 20.0,
            "current_node": "leaf",
            "mapping": {
                "root": {"parent": null, "children": ["a", "b"], "message": null},
                "a": node(Some("root"), "user", "from a", 100.0),
                "b": node(Some("root"), "user", "from b", 200.0),
                "leaf": node(Some("a"), "assistant", "answer", 150.0),
            }
        });

        let parsed = parse_record(&record).unwrap();
        let texts: Vec<&str> = parsed
            .messages
            .iter()
            .map(|m| m.content_text.as_str())
            .collect();
        assert_eq!(texts, vec!["from a", "answer"]);
        assert_eq!(parsed.messages[0].turn_index, 0);
        assert_eq!(parsed.messages[1].turn_index, 1);
    }

    #[test]
    fn picks_latest_child_without_hint() {
        let record = json!({
            "id": "conv-2",
            "title": "No hint",
            "mapping": {
                "root": {"parent": null, "children": ["a", "b"], "message": null},
                "a": node(Some("root"), "user", "older", 100.0),
                "b": node(Some("root"), "user", "newer", 200.0),
            }
        });

        let parsed = parse_record(&record).unwrap();
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].content_text, "newer");
    }

    #[test]
    fn timestamp_tie_breaks_to_smallest_id() {
        let record = json!({
            "id": "conv-3",
            "title": "Tie",
            "mapping": {
                "root": {"parent": null, "children": ["zz", "aa"], "message": null},
                "zz": node(Some("root"), "user", "from zz", 100.0),
                "aa": node(Some("root"), "user", "from aa", 100.0),
            }
        });

        let parsed = parse_record(&record).unwrap();
        assert_eq!(parsed.messages[0].content_text, "from aa");
    }

    #[test]
    fn skips_empty_system_keeps_tool() {
        let record = json!({
            "id": "conv-4",
            "title": "Roles",
            "current_node": "n3",
            "mapping": {
                "n0": {"parent": null, "children": ["n1"], "message": {
                    "author": {"role": "system"},
                    "content": {"content_type": "text", "parts": [""]}
                }},
                "n1": node(Some("n0"), "user", "run it", 1.0),
                "n2": {"parent": "n1", "children": ["n3"], "message": {
                    "id": "tool-msg",
                    "author": {"role": "tool"},
                    "create_time": 2.0,
                    "content": {"content_type": "tool_result", "parts": [{"content_type": "tool_result", "text": "ok"}]}
                }},
                "n3": node(Some("n2"), "assistant", "done", 3.0),
            }
        });

        let parsed = parse_record(&record).unwrap();
        let roles: Vec<&str> = parsed.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "tool", "assistant"]);
        assert_eq!(
            parsed.messages[1].content_text,
            "[content_type: tool_result]\nok"
        );
        // Dense turn indexes despite the skipped system node.
        let turns: Vec<i64> = parsed.messages.iter().map(|m| m.turn_index).collect();
        assert_eq!(turns, vec![0, 1, 2]);
    }

    #[test]
    fn unknown_role_folds() {
        let record = json!({
            "id": "conv-5",
            "title": "Weird",
            "mapping": {
                "root": {"parent": null, "children": [], "message": {
                    "author": {"role": "critic"},
                    "create_time": 1.0,
                    "content": {"content_type": "text", "parts": ["hm"]}
                }},
            }
        });

        let parsed = parse_record(&record).unwrap();
        assert_eq!(parsed.messages[0].role.as_str(), "unknown");
    }

    #[test]
    fn flattening_trims_trailing_whitespace() {
        let (_, text) = flatten_content(Some(&json!({
            "content_type": "text",
            "parts": ["line one   \nline two\t"]
        })));
        assert_eq!(text, "line one\nline two");
    }

    #[test]
    fn multiple_parts_join_with_blank_line() {
        let (_, text) = flatten_content(Some(&json!({
            "content_type": "text",
            "parts": ["first", "second"]
        })));
        assert_eq!(text, "first\n\nsecond");
    }

    #[test]
    fn missing_timestamps_default_to_zero() {
        let record = json!({
            "id": "conv-6",
            "title": "No times",
            "mapping": {}
        });
        let parsed = parse_record(&record).unwrap();
        assert_eq!(parsed.created_at, 0);
        assert_eq!(parsed.updated_at, 0);
    }

    #[test]
    fn raw_hash_is_stable_and_content_sensitive() {
        let a = json!({"id": "x", "title": "t"});
        let b = json!({"title": "t", "id": "x"});
        let c = json!({"id": "x", "title": "changed"});
        assert_eq!(raw_hash(&a), raw_hash(&b));
        assert_ne!(raw_hash(&a), raw_hash(&c));
    }

    #[test]
    fn unknown_fields_land_in_meta() {
        let record = json!({
            "id": "conv-7",
            "title": "Meta",
            "plugin_ids": ["p1"],
            "mapping": {}
        });
        let parsed = parse_record(&record).unwrap();
        let meta: Value = serde_json::from_str(&parsed.meta_json).unwrap();
        assert_eq!(meta["plugin_ids"][0], "p1");
    }
}
