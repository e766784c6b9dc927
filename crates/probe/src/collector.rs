// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inventory collection from the local host via `sysinfo`, plus an
//! `extensions` map with the platform detail that has no canonical slot.

use picket_wire::{epoch_s, InventorySnapshot};
use sysinfo::{Disks, Networks, System};

/// Assemble a snapshot of this host. Synchronous and mildly expensive;
/// callers run it off the async runtime.
pub fn collect(agent_id: &str) -> InventorySnapshot {
    let mut sys = System::new_all();
    sys.refresh_all();

    let cpu_model = sys
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_owned())
        .unwrap_or_default();

    let disks = Disks::new_with_refreshed_list();
    let mut disk_total = 0u64;
    let mut disk_free = 0u64;
    for disk in disks.list() {
        disk_total += disk.total_space();
        disk_free += disk.available_space();
    }

    let networks = Networks::new_with_refreshed_list();
    let mut ip_list = Vec::new();
    let mut mac_list = Vec::new();
    for (name, data) in networks.iter() {
        if name == "lo" || name.starts_with("lo0") {
            continue;
        }
        for ip in data.ip_networks() {
            ip_list.push(ip.addr.to_string());
        }
        let mac = data.mac_address().to_string();
        if mac != "00:00:00:00:00:00" {
            mac_list.push(mac);
        }
    }
    ip_list.sort();
    ip_list.dedup();
    mac_list.sort();
    mac_list.dedup();

    let mut extensions = serde_json::Map::new();
    if let Some(kernel) = System::kernel_version() {
        extensions.insert("kernel_version".into(), serde_json::json!(kernel));
    }
    extensions.insert("boot_time_s".into(), serde_json::json!(System::boot_time()));
    let load = System::load_average();
    extensions.insert(
        "load_average".into(),
        serde_json::json!({ "one": load.one, "five": load.five, "fifteen": load.fifteen }),
    );

    InventorySnapshot {
        agent_id: agent_id.to_owned(),
        collected_at: epoch_s(),
        hostname: System::host_name().unwrap_or_default(),
        os: System::long_os_version().unwrap_or_default(),
        platform: std::env::consts::OS.to_owned(),
        architecture: std::env::consts::ARCH.to_owned(),
        cpu_count: sys.cpus().len() as u32,
        cpu_model,
        memory_total: sys.total_memory(),
        memory_used: sys.used_memory(),
        memory_free: sys.free_memory(),
        disk_total,
        disk_used: disk_total.saturating_sub(disk_free),
        disk_free,
        ip_list,
        mac_list,
        extensions,
    }
}

#[cfg(test)]
#[path = "collector_tests.rs"]
mod tests;
