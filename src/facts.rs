//! # Hardware Facts Parser
//!
//! Parses the line-oriented `key=value` output of the hardware scanner
//! script into a two-level JSON mapping. Keys of the form `prefix.subkey`
//! are grouped under `prefix`; CSV values of whitelisted keys (and of keys
//! under a small set of safe prefixes) become arrays.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Keys whose values are always comma-separated lists.
const ARRAY_KEYS: &[&str] = &["storage.filesystems", "network.dns_servers"];

/// Prefixes where a comma in the value is safe to treat as a separator.
const ARRAY_SAFE_PREFIXES: &[&str] = &["storage.", "network.", "user.", "system."];

static IP_AT_IFACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+\.\d+\.\d+@").expect("ip@iface regex is valid"));

fn should_be_array(full_key: &str, value: &str) -> bool {
    if ARRAY_KEYS.contains(&full_key) {
        return true;
    }
    // Heuristic: CSV-looking values under safe prefixes, but not address
    // lists shaped like `ip@iface` which legitimately contain commas.
    value.contains(',')
        && !IP_AT_IFACE.is_match(value)
        && ARRAY_SAFE_PREFIXES.iter().any(|p| full_key.starts_with(p))
}

fn parse_value(full_key: &str, raw: &str) -> Value {
    if should_be_array(full_key, raw) {
        let parts: Vec<Value> = raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| Value::String(p.to_string()))
            .collect();
        if !parts.is_empty() {
            return Value::Array(parts);
        }
    }
    Value::String(raw.to_string())
}

/// Parse scanner stdout lines into a facts mapping.
///
/// Lines without `=` are ignored. `prefix.subkey=value` entries are grouped
/// as `{"prefix": {"subkey": value}}`; flat keys stay at the top level. A
/// flat key colliding with a group keeps the grouped entries merged on top.
pub fn parse_facts<'a, I>(lines: I) -> Map<String, Value>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut result: Map<String, Value> = Map::new();
    let mut groups: BTreeMap<String, Map<String, Value>> = BTreeMap::new();

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let value = parse_value(key, raw_value);

        if let Some((prefix, subkey)) = key.split_once('.') {
            groups
                .entry(prefix.to_string())
                .or_default()
                .insert(subkey.to_string(), value);
        } else {
            result.insert(key.to_string(), value);
        }
    }

    for (prefix, subdict) in groups {
        match result.get_mut(&prefix) {
            Some(Value::Object(existing)) => {
                existing.extend(subdict);
            }
            _ => {
                result.insert(prefix, Value::Object(subdict));
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_dotted_keys() {
        let facts = parse_facts(["cpu.model=AMD EPYC", "cpu.cores=16", "os=nixos"]);
        assert_eq!(facts["os"], "nixos");
        assert_eq!(facts["cpu"]["model"], "AMD EPYC");
        assert_eq!(facts["cpu"]["cores"], "16");
    }

    #[test]
    fn whitelisted_keys_become_arrays() {
        let facts = parse_facts(["storage.filesystems=ext4,btrfs,vfat"]);
        assert_eq!(
            facts["storage"]["filesystems"],
            serde_json::json!(["ext4", "btrfs", "vfat"])
        );
    }

    #[test]
    fn dns_servers_become_array() {
        let facts = parse_facts(["network.dns_servers=10.0.0.1, 10.0.0.2"]);
        assert_eq!(
            facts["network"]["dns_servers"],
            serde_json::json!(["10.0.0.1", "10.0.0.2"])
        );
    }

    #[test]
    fn csv_heuristic_limited_to_safe_prefixes() {
        let facts = parse_facts(["os.name=NixOS, the purely functional distro"]);
        // `os.` is not a safe prefix, value stays a string.
        assert_eq!(facts["os"]["name"], "NixOS, the purely functional distro");

        let facts = parse_facts(["user.groups=wheel,docker"]);
        assert_eq!(facts["user"]["groups"], serde_json::json!(["wheel", "docker"]));
    }

    #[test]
    fn ip_at_iface_values_stay_strings() {
        let facts = parse_facts(["network.addresses=10.0.0.5@eth0,10.0.0.6@eth1"]);
        assert_eq!(facts["network"]["addresses"], "10.0.0.5@eth0,10.0.0.6@eth1");
    }

    #[test]
    fn ignores_malformed_lines() {
        let facts = parse_facts(["", "no-equals-here", "  ", "k=v"]);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts["k"], "v");
    }

    #[test]
    fn empty_csv_value_stays_string() {
        let facts = parse_facts(["storage.filesystems=,,"]);
        assert_eq!(facts["storage"]["filesystems"], ",,");
    }

    #[test]
    fn value_may_contain_equals() {
        let facts = parse_facts(["boot.cmdline=root=/dev/sda1 quiet"]);
        assert_eq!(facts["boot"]["cmdline"], "root=/dev/sda1 quiet");
    }
}
