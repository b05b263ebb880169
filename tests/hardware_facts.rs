//! A full scanner transcript through the facts parser, shaped like the
//! output of `scripts/hardware_scanner.sh` on a small NixOS host.

use nixos_infra_controller::facts::parse_facts;

const TRANSCRIPT: &str = "\
os=linux
kernel=6.6.32
arch=x86_64
cpu.model=AMD EPYC 7302P 16-Core Processor
cpu.cores=16
memory.total_kb=65536000
storage.disks=sda,nvme0n1
storage.filesystems=btrfs,ext4,vfat
network.primary_interface=enp1s0
network.mac_address=52:54:00:12:34:56
network.dns_servers=10.0.0.1,10.0.0.2
system.vendor=Supermicro
system.product=Super Server
";

#[test]
fn full_transcript_groups_and_arrays() {
    let facts = parse_facts(TRANSCRIPT.lines());

    // Flat keys stay top-level.
    assert_eq!(facts["os"], "linux");
    assert_eq!(facts["arch"], "x86_64");

    // Dotted keys group into sections.
    assert_eq!(facts["cpu"]["model"], "AMD EPYC 7302P 16-Core Processor");
    assert_eq!(facts["memory"]["total_kb"], "65536000");
    assert_eq!(facts["system"]["vendor"], "Supermicro");

    // Whitelisted and safe-prefix CSV values become arrays.
    assert_eq!(
        facts["storage"]["filesystems"],
        serde_json::json!(["btrfs", "ext4", "vfat"])
    );
    assert_eq!(
        facts["storage"]["disks"],
        serde_json::json!(["sda", "nvme0n1"])
    );
    assert_eq!(
        facts["network"]["dns_servers"],
        serde_json::json!(["10.0.0.1", "10.0.0.2"])
    );

    // MAC addresses contain colons, not commas, and stay scalar.
    assert_eq!(facts["network"]["mac_address"], "52:54:00:12:34:56");

    // The mapping round-trips through JSON the way it lands in the
    // Machine status patch.
    let as_value = serde_json::Value::Object(facts);
    let text = serde_json::to_string(&as_value).unwrap();
    let back: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(back, as_value);
}

#[test]
fn transcript_with_windows_line_endings() {
    let crlf = TRANSCRIPT.replace('\n', "\r\n");
    let facts = parse_facts(crlf.lines());
    assert_eq!(facts["os"], "linux");
    assert_eq!(facts["cpu"]["cores"], "16");
}
