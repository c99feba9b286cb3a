//! Node facts read from sysfs and procfs.
//!
//! The identity (`uuid` plus the MAC-derived `mac_id` list) scopes every
//! request the agent makes. The full fact snapshot is what registration
//! sends; its fingerprint is kept in the facts file so unchanged facts are
//! not re-registered.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::types::NodeIdentity;

pub type FactMap = BTreeMap<String, String>;

pub trait FactSource {
    fn identity(&self) -> NodeIdentity;
    fn collect(&self) -> Result<FactMap>;
    /// When facts were last recorded as registered; `None` if never.
    fn last_saved(&self) -> Option<SystemTime>;
}

/// Stable hex SHA-256 over the sorted fact map.
pub fn fingerprint(facts: &FactMap) -> Result<String> {
    let encoded = serde_json::to_vec(facts).context("serialize facts")?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedRecord {
    fingerprint: String,
}

/// Fingerprint of the last registered fact snapshot.
#[derive(Debug, Clone)]
pub struct SavedFacts {
    path: PathBuf,
}

impl SavedFacts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn fingerprint(&self) -> Option<String> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "unreadable facts file");
                return None;
            }
        };
        match serde_json::from_str::<SavedRecord>(&contents) {
            Ok(record) => Some(record.fingerprint),
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "corrupt facts file");
                None
            }
        }
    }

    pub fn record(&self, fingerprint: &str) -> Result<()> {
        let record = SavedRecord {
            fingerprint: fingerprint.to_string(),
        };
        let mut buf = serde_json::to_string(&record).context("serialize facts record")?;
        buf.push('\n');
        super::write_atomic(&self.path, &buf)
            .with_context(|| format!("write facts file {}", self.path.display()))
    }

    pub fn saved_at(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|meta| meta.modified()).ok()
    }
}

/// [`FactSource`] reading a Linux root filesystem (normally `/`).
#[derive(Debug, Clone)]
pub struct SysfsFacts {
    root: PathBuf,
    saved: SavedFacts,
    exclude: Option<Regex>,
}

impl SysfsFacts {
    pub fn new(root: impl Into<PathBuf>, facts_file: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            saved: SavedFacts::new(facts_file),
            exclude: None,
        }
    }

    /// Leave facts whose names match `pattern` out of [`FactSource::collect`].
    pub fn with_exclusion(mut self, pattern: Option<Regex>) -> Self {
        self.exclude = pattern;
        self
    }

    fn read_trimmed(&self, relative: &str) -> Option<String> {
        let path = self.root.join(relative);
        match fs::read_to_string(&path) {
            Ok(value) => Some(value.trim().to_string()).filter(|v| !v.is_empty()),
            Err(err) => {
                debug!(path = %path.display(), err = %err, "fact unavailable");
                None
            }
        }
    }

    /// `(interface, mac)` for wired interfaces (`eth*`, `en*`), sorted by name.
    fn interfaces(&self) -> Vec<(String, String)> {
        let dir = self.root.join("sys/class/net");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(path = %dir.display(), err = %err, "no network interfaces");
                return Vec::new();
            }
        };
        let mut found: Vec<(String, String)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_wired_interface(name))
            .filter_map(|name| {
                let mac = self.read_trimmed(&format!("sys/class/net/{name}/address"))?;
                Some((name, mac))
            })
            .collect();
        found.sort();
        found
    }
}

fn is_wired_interface(name: &str) -> bool {
    match name.strip_prefix("eth") {
        Some(index) => !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()),
        None => name.starts_with("en"),
    }
}

/// MAC address without separators, lowercase (`52:54:00:AB` -> `525400ab`).
fn mac_to_id(mac: &str) -> String {
    mac.chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl FactSource for SysfsFacts {
    fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            mac_id: self
                .interfaces()
                .iter()
                .map(|(_, mac)| mac_to_id(mac))
                .collect(),
            uuid: self
                .read_trimmed("sys/class/dmi/id/product_uuid")
                .unwrap_or_default(),
        }
    }

    fn collect(&self) -> Result<FactMap> {
        let mut facts = FactMap::new();
        for (key, relative) in [
            ("hostname", "proc/sys/kernel/hostname"),
            ("kernel_release", "proc/sys/kernel/osrelease"),
            ("product_name", "sys/class/dmi/id/product_name"),
            ("product_serial", "sys/class/dmi/id/product_serial"),
            ("sys_vendor", "sys/class/dmi/id/sys_vendor"),
            ("bios_version", "sys/class/dmi/id/bios_version"),
        ] {
            if let Some(value) = self.read_trimmed(relative) {
                facts.insert(key.to_string(), value);
            }
        }
        if let Some(meminfo) = self.read_trimmed("proc/meminfo")
            && let Some(total) = meminfo
                .lines()
                .find_map(|line| line.strip_prefix("MemTotal:"))
        {
            facts.insert("memory_total".to_string(), total.trim().to_string());
        }
        for (name, mac) in self.interfaces() {
            facts.insert(format!("macaddress_{name}"), mac);
        }
        if let Some(pattern) = &self.exclude {
            let before = facts.len();
            facts.retain(|name, _| !pattern.is_match(name));
            debug!(%pattern, excluded = before - facts.len(), "applied fact exclusion");
        }
        Ok(facts)
    }

    fn last_saved(&self) -> Option<SystemTime> {
        self.saved.saved_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_root() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        for (name, mac) in [
            ("eth1", "52:54:00:AB:CD:02"),
            ("eth0", "52:54:00:ab:cd:01"),
            ("lo", "00:00:00:00:00:00"),
            ("wlan0", "aa:bb:cc:dd:ee:ff"),
        ] {
            let dir = root.join("sys/class/net").join(name);
            fs::create_dir_all(&dir).expect("mkdir");
            fs::write(dir.join("address"), format!("{mac}\n")).expect("write");
        }
        let dmi = root.join("sys/class/dmi/id");
        fs::create_dir_all(&dmi).expect("mkdir");
        fs::write(dmi.join("product_uuid"), "4C4C4544-0042\n").expect("write");
        fs::write(dmi.join("sys_vendor"), "Dell Inc.\n").expect("write");
        fs::create_dir_all(root.join("proc")).expect("mkdir");
        fs::write(root.join("proc/meminfo"), "MemTotal:       16318480 kB\nMemFree: 1 kB\n").expect("write");
        temp
    }

    #[test]
    fn identity_uses_wired_interfaces_in_name_order() {
        let root = fake_root();
        let facts = SysfsFacts::new(root.path(), root.path().join("prev_facts.json"));
        let identity = facts.identity();
        assert_eq!(identity.uuid, "4C4C4544-0042");
        assert_eq!(identity.mac_id, ["525400abcd01", "525400abcd02"]);
    }

    #[test]
    fn identity_degrades_to_empty_on_bare_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let facts = SysfsFacts::new(temp.path(), temp.path().join("prev_facts.json"));
        assert_eq!(facts.identity(), NodeIdentity::default());
    }

    #[test]
    fn collect_reads_available_facts() {
        let root = fake_root();
        let facts = SysfsFacts::new(root.path(), root.path().join("prev_facts.json"));
        let map = facts.collect().expect("collect");
        assert_eq!(map.get("sys_vendor").map(String::as_str), Some("Dell Inc."));
        assert_eq!(map.get("memory_total").map(String::as_str), Some("16318480 kB"));
        assert!(map.contains_key("macaddress_eth0"));
        assert!(!map.contains_key("macaddress_wlan0"));
        assert!(!map.contains_key("hostname"));
    }

    #[test]
    fn collect_drops_facts_matching_exclusion() {
        let root = fake_root();
        let pattern = Regex::new("^(macaddress_eth1|memory_.*)$").expect("regex");
        let facts = SysfsFacts::new(root.path(), root.path().join("prev_facts.json"))
            .with_exclusion(Some(pattern));
        let map = facts.collect().expect("collect");
        assert!(map.contains_key("macaddress_eth0"));
        assert!(!map.contains_key("macaddress_eth1"));
        assert!(!map.contains_key("memory_total"));
        assert_eq!(map.get("sys_vendor").map(String::as_str), Some("Dell Inc."));

        // Identity still sees every wired interface.
        assert_eq!(facts.identity().mac_id.len(), 2);
    }

    #[test]
    fn fingerprint_changes_with_facts() {
        let mut facts = FactMap::new();
        facts.insert("hostname".to_string(), "node1".to_string());
        let first = fingerprint(&facts).expect("fingerprint");
        assert_eq!(first.len(), 64);
        assert_eq!(first, fingerprint(&facts.clone()).expect("fingerprint"));

        facts.insert("hostname".to_string(), "node2".to_string());
        assert_ne!(first, fingerprint(&facts).expect("fingerprint"));
    }

    #[test]
    fn saved_facts_round_trip_and_timestamp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let saved = SavedFacts::new(temp.path().join("prev_facts.json"));
        assert_eq!(saved.fingerprint(), None);
        assert_eq!(saved.saved_at(), None);

        saved.record("abc123").expect("record");
        assert_eq!(saved.fingerprint().as_deref(), Some("abc123"));
        assert!(saved.saved_at().is_some());
    }

    #[test]
    fn wired_interface_names() {
        assert!(is_wired_interface("eth0"));
        assert!(is_wired_interface("eth12"));
        assert!(is_wired_interface("enp3s0"));
        assert!(!is_wired_interface("eth"));
        assert!(!is_wired_interface("ethx"));
        assert!(!is_wired_interface("lo"));
    }
}
