//! Waiting-user gallery as handed over by the check-in backend.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use kiosk_vision::{Embedding, GalleryMember, EMBEDDING_DIM};
use serde::{Deserialize, Serialize};

/// Wire shape of one waiting user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitUser {
    #[serde(alias = "userOid")]
    pub user_oid: String,
    pub name: String,
    pub level: String,
    /// Enrolled face feature, serialised as text.
    pub landmark: String,
    #[serde(rename = "queue_Oid", alias = "queue_oid")]
    pub queue_oid: String,
    #[serde(rename = "commuteType", alias = "commute_type")]
    pub commute_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_oid: String,
    pub name: String,
    pub queue_oid: String,
}

impl Identity {
    pub fn masked_name(&self) -> String {
        masked_name(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub level: String,
    pub commute_type: String,
}

#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: Identity,
    pub embedding: Option<Embedding>,
    pub metadata: Metadata,
}

impl GalleryMember for GalleryEntry {
    type Identity = Identity;

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_ref().map(Embedding::as_slice)
    }
}

impl From<WaitUser> for GalleryEntry {
    fn from(user: WaitUser) -> Self {
        let embedding = decode_embedding(user.landmark.as_bytes());
        if embedding.is_none() && !user.landmark.trim().is_empty() {
            log::debug!("user {}: landmark is not a usable embedding", user.user_oid);
        }
        Self {
            identity: Identity {
                user_oid: user.user_oid,
                name: user.name,
                queue_oid: user.queue_oid,
            },
            embedding,
            metadata: Metadata {
                level: user.level,
                commute_type: user.commute_type,
            },
        }
    }
}

/// Decode a stored feature vector.
///
/// Accepts a JSON array, comma/whitespace separated text, or raw
/// little-endian `f32` bytes. Anything that is not exactly
/// [`EMBEDDING_DIM`] finite values yields `None`.
pub fn decode_embedding(blob: &[u8]) -> Option<Embedding> {
    let values = match std::str::from_utf8(blob) {
        Ok(text) if text.trim_start().starts_with('[') => {
            serde_json::from_str::<Vec<f32>>(text).ok()?
        }
        Ok(text) if looks_numeric(text) => parse_delimited(text)?,
        _ => decode_le_bytes(blob)?,
    };
    if values.len() != EMBEDDING_DIM || !values.iter().all(|v| v.is_finite()) {
        return None;
    }
    Embedding::from_vec(values).ok()
}

fn looks_numeric(text: &str) -> bool {
    !text.trim().is_empty()
        && text.chars().all(|c| {
            c.is_ascii_digit() || c.is_ascii_whitespace() || matches!(c, ',' | '.' | '-' | '+' | 'e' | 'E')
        })
}

fn parse_delimited(text: &str) -> Option<Vec<f32>> {
    text.split(|c: char| c == ',' || c.is_ascii_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f32>().ok())
        .collect()
}

fn decode_le_bytes(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % std::mem::size_of::<f32>() != 0 {
        return None;
    }
    let raw: Vec<u32> = bytemuck::pod_collect_to_vec(blob);
    Some(raw.into_iter().map(|bits| f32::from_bits(u32::from_le(bits))).collect())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Snapshot {
    List(Vec<WaitUser>),
    /// Keyed by user oid, as the realtime store exports it.
    Keyed(BTreeMap<String, WaitUser>),
}

/// Load a gallery snapshot from a JSON file.
pub fn load_snapshot(path: &Path) -> Result<Vec<GalleryEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading gallery snapshot {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&raw)
        .with_context(|| format!("parsing gallery snapshot {}", path.display()))?;

    let users = match snapshot {
        Snapshot::List(users) => users,
        Snapshot::Keyed(map) => map
            .into_iter()
            .map(|(key, mut user)| {
                if user.user_oid.is_empty() {
                    user.user_oid = key;
                }
                user
            })
            .collect(),
    };
    let entries: Vec<GalleryEntry> = users.into_iter().map(GalleryEntry::from).collect();
    log::info!(
        "gallery: {} waiting users, {} with embeddings",
        entries.len(),
        entries.iter().filter(|e| e.embedding.is_some()).count()
    );
    Ok(entries)
}

/// Name for public display: digits-only names as-is, otherwise every
/// character but the first and last is starred (two characters keep the
/// first only).
pub fn masked_name(name: &str) -> String {
    let s = name.trim();
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s.to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    match chars.len() {
        0 | 1 => s.to_string(),
        2 => format!("{}*", chars[0]),
        n => chars
            .iter()
            .enumerate()
            .map(|(i, &c)| if i == 0 || i == n - 1 { c } else { '*' })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ramp() -> Vec<f32> {
        (0..EMBEDDING_DIM).map(|i| i as f32 / 1000.0).collect()
    }

    #[test]
    fn decodes_json_array() {
        let json = serde_json::to_string(&ramp()).unwrap();
        let e = decode_embedding(json.as_bytes()).unwrap();
        assert_eq!(e.as_slice(), ramp().as_slice());
    }

    #[test]
    fn decodes_delimited_text() {
        let text = ramp()
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let e = decode_embedding(text.as_bytes()).unwrap();
        assert_eq!(e.as_slice(), ramp().as_slice());

        let spaced = text.replace(", ", "\n");
        assert!(decode_embedding(spaced.as_bytes()).is_some());
    }

    #[test]
    fn decodes_little_endian_bytes() {
        let bytes: Vec<u8> = ramp().iter().flat_map(|v| v.to_le_bytes()).collect();
        let e = decode_embedding(&bytes).unwrap();
        assert_eq!(e.as_slice(), ramp().as_slice());
    }

    #[test]
    fn rejects_wrong_length_and_non_finite() {
        let short = serde_json::to_string(&vec![0.5f32; 511]).unwrap();
        let long = serde_json::to_string(&vec![0.5f32; 513]).unwrap();
        assert!(decode_embedding(short.as_bytes()).is_none());
        assert!(decode_embedding(long.as_bytes()).is_none());

        let mut values = ramp();
        values[7] = f32::NAN;
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        assert!(decode_embedding(&bytes).is_none());

        assert!(decode_embedding(b"").is_none());
        assert!(decode_embedding(b"not a vector").is_none());
        assert!(decode_embedding(&[1, 2, 3]).is_none());
    }

    #[test]
    fn masks_names_for_display() {
        assert_eq!(masked_name("1533"), "1533");
        assert_eq!(masked_name("김"), "김");
        assert_eq!(masked_name("김철"), "김*");
        assert_eq!(masked_name("홍길동"), "홍*동");
        assert_eq!(masked_name("  Alice "), "A***e");
        assert_eq!(masked_name("   "), "");
    }

    #[test]
    fn loads_list_and_keyed_snapshots() -> Result<()> {
        let landmark = serde_json::to_string(&ramp())?;
        let list = serde_json::json!([
            {"user_oid": "u1", "name": "홍길동", "level": "A", "landmark": landmark,
             "queue_Oid": "q1", "commuteType": "IN"},
            {"user_oid": "u2", "name": "Bob", "landmark": ""},
        ]);
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{list}")?;

        let entries = load_snapshot(file.path())?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].identity.queue_oid, "q1");
        assert_eq!(entries[0].metadata.commute_type, "IN");
        assert!(entries[0].embedding.is_some());
        assert!(entries[1].embedding.is_none());
        assert_eq!(GalleryMember::embedding(&entries[1]), None);

        let keyed = serde_json::json!({
            "u9": {"name": "Carol", "landmark": landmark},
        });
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{keyed}")?;
        let entries = load_snapshot(file.path())?;
        assert_eq!(entries[0].identity.user_oid, "u9");
        assert_eq!(entries[0].identity.masked_name(), "C***l");
        Ok(())
    }

    #[test]
    fn unreadable_snapshot_is_an_error() {
        assert!(load_snapshot(Path::new("/nonexistent/gallery.json")).is_err());
    }
}
