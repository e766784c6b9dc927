// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn snapshot() -> InventorySnapshot {
    InventorySnapshot {
        agent_id: "probe-1".into(),
        collected_at: 1700000000,
        hostname: "db-04".into(),
        os: "Ubuntu 24.04".into(),
        platform: "linux".into(),
        architecture: "x86_64".into(),
        cpu_count: 16,
        cpu_model: "AMD EPYC 7313".into(),
        memory_total: 64 << 30,
        memory_used: 20 << 30,
        memory_free: 44 << 30,
        disk_total: 1 << 40,
        disk_used: 300 << 30,
        disk_free: 724 << 30,
        ip_list: vec!["10.0.4.2".into()],
        mac_list: vec!["52:54:00:aa:bb:cc".into()],
        extensions: serde_json::Map::new(),
    }
}

#[test]
fn digest_ignores_collection_time_and_usage() {
    let a = snapshot();
    let mut b = snapshot();
    b.collected_at += 60;
    b.memory_used += 512 << 20;
    b.memory_free -= 512 << 20;
    b.disk_used += 1 << 30;
    assert_eq!(a.digest(), b.digest());
}

#[test]
fn digest_tracks_descriptive_changes() {
    let a = snapshot();

    let mut renamed = snapshot();
    renamed.hostname = "db-05".into();
    assert_ne!(a.digest(), renamed.digest());

    let mut readdressed = snapshot();
    readdressed.ip_list.push("10.0.4.3".into());
    assert_ne!(a.digest(), readdressed.digest());

    let mut extended = snapshot();
    extended.extensions.insert("bmc_firmware".into(), serde_json::json!("2.81"));
    assert_ne!(a.digest(), extended.digest());
}

#[test]
fn empty_extensions_are_omitted_from_wire() -> anyhow::Result<()> {
    let value = serde_json::to_value(snapshot())?;
    assert!(value.get("extensions").is_none());
    Ok(())
}

#[test]
fn missing_extensions_deserialize_to_empty() -> anyhow::Result<()> {
    let mut value = serde_json::to_value(snapshot())?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("extensions");
    }
    let snap: InventorySnapshot = serde_json::from_value(value)?;
    assert!(snap.extensions.is_empty());
    Ok(())
}
