use serde::{Deserialize, Serialize};

/// Stable identity of a physical host or guest, established once at startup
/// and unchanged for the lifetime of the boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDetails {
    pub name: String,
    pub id: String,
}

impl NodeDetails {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self { name: name.into(), id: id.into() }
    }

    /// URL-path-safe form used in orchestrator endpoints such as
    /// `/api/v1/node_metrics/{id}`. Fixes Open Question (c): the bare `id`,
    /// percent-encoded, rather than a struct interpolation.
    pub fn url_safe_id(&self) -> String {
        urlencode(&self.id)
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_safe_id_encodes_reserved_chars() {
        let n = NodeDetails::new("worker-1", "ab:cd/ef gh");
        assert_eq!(n.url_safe_id(), "ab%3Acd%2Fef%20gh");
    }

    #[test]
    fn url_safe_id_passes_through_plain_ids() {
        let n = NodeDetails::new("worker-1", "0123-abcd-ef01");
        assert_eq!(n.url_safe_id(), "0123-abcd-ef01");
    }
}
