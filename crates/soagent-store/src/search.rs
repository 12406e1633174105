//! Case-insensitive substring search across all session logs.

use serde::Serialize;

use soagent_core::ids::SessionId;
use soagent_core::messages::Role;

use crate::error::StoreError;
use crate::store::SessionStore;

const MAX_MATCHES_PER_SESSION: usize = 3;
const PREVIEW_BEFORE: usize = 40;
const PREVIEW_AFTER: usize = 60;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    pub id: String,
    pub role: Role,
    pub preview: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub session_id: SessionId,
    pub session_title: String,
    pub matches: Vec<SearchMatch>,
}

impl SessionStore {
    /// Scan every log for `query`, most recently active sessions first.
    /// Sessions with no match are omitted; matched sessions carry at most
    /// three previews each.
    pub fn search(&self, query: &str) -> Result<Vec<SearchHit>, StoreError> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for session in self.list() {
            let messages = self.messages(&session.id)?;
            let mut matches = Vec::new();
            for msg in &messages {
                if matches.len() >= MAX_MATCHES_PER_SESSION {
                    break;
                }
                if let Some(pos) = msg.content.to_lowercase().find(&needle) {
                    matches.push(SearchMatch {
                        id: msg.id.as_str().to_string(),
                        role: msg.role,
                        preview: preview(&msg.content, pos, needle.len()),
                    });
                }
            }
            if !matches.is_empty() {
                hits.push(SearchHit {
                    session_id: session.id,
                    session_title: session.title,
                    matches,
                });
            }
        }
        Ok(hits)
    }
}

/// Window around the match with ellipses marking elision. `pos` is a byte
/// offset into the lowercased content; it is only trusted against the
/// original when lowercasing did not change byte lengths.
fn preview(content: &str, pos: usize, needle_len: usize) -> String {
    if content.to_lowercase().len() != content.len() {
        // Lowercasing shifted offsets; fall back to a plain head preview.
        let end = ceil_boundary(content, PREVIEW_BEFORE + PREVIEW_AFTER);
        let mut out = content[..end].to_string();
        if end < content.len() {
            out.push('…');
        }
        return out;
    }

    let start = floor_boundary(content, pos.saturating_sub(PREVIEW_BEFORE));
    let end = ceil_boundary(content, (pos + needle_len + PREVIEW_AFTER).min(content.len()));

    let mut out = String::new();
    if start > 0 {
        out.push('…');
    }
    out.push_str(&content[start..end]);
    if end < content.len() {
        out.push('…');
    }
    out
}

fn floor_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
