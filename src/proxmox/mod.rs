// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Proxmox VE API client using ticket (username/password) authentication
pub struct PveClient {
    base_url: String,
    client: reqwest::Client,
}

/// Session obtained from /access/ticket
#[derive(Debug, Clone, Deserialize)]
pub struct PveTicket {
    pub ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_token: String,
    #[serde(default)]
    pub username: String,
}

/// One entry of /cluster/resources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterResource {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub resource_type: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub template: u8,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub maxcpu: u32,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub disk: u64,
    #[serde(default)]
    pub maxdisk: u64,
    #[serde(default)]
    pub uptime: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxStatistics {
    pub users: usize,
    pub templates: usize,
    pub vms: usize,
    pub number_of_topologies: usize,
    pub number_of_scenarios: usize,
    pub number_of_roles: usize,
    pub number_of_pools: usize,
    pub cpu_usage_percentage: f64,
    pub max_cpu: u32,
    #[serde(rename = "memoryUsedGiB")]
    pub memory_used_gib: f64,
    #[serde(rename = "memoryTotalGiB")]
    pub memory_total_gib: f64,
    #[serde(rename = "memoryFreeGiB")]
    pub memory_free_gib: f64,
    #[serde(rename = "diskUsedGiB")]
    pub disk_used_gib: f64,
    #[serde(rename = "diskTotalGiB")]
    pub disk_total_gib: f64,
    pub uptime_formatted: String,
}

/// Counts that come from outside the cluster resource list
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCounts {
    pub topologies: usize,
    pub scenarios: usize,
    pub pools: usize,
    pub roles: usize,
}

impl PveClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let builder = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true); // PVE often uses self-signed certs

        let client = builder.build().unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// POST /access/ticket with username and password
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<PveTicket, String> {
        let url = format!("{}/api2/json/access/ticket", self.base_url);
        debug!("PVE POST {}", url);

        let resp = self.client.post(&url)
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .map_err(|e| format!("failed to authenticate: {}", e))?;

        if !resp.status().is_success() {
            return Err(format!("authentication failed with status: {}", resp.status().as_u16()));
        }

        let json: serde_json::Value = resp.json().await
            .map_err(|e| format!("failed to parse auth response: {}", e))?;
        let data = json.get("data").cloned().unwrap_or(json);
        serde_json::from_value(data).map_err(|e| format!("failed to parse auth response: {}", e))
    }

    /// GET /cluster/resources using a ticket session
    pub async fn cluster_resources(&self, ticket: &PveTicket) -> Result<Vec<ClusterResource>, String> {
        let url = format!("{}/api2/json/cluster/resources", self.base_url);
        debug!("PVE GET {}", url);

        let resp = self.client.get(&url)
            .header("CSRFPreventionToken", &ticket.csrf_token)
            .header("Cookie", format!("PVEAuthCookie={}", ticket.ticket))
            .send()
            .await
            .map_err(|e| format!("failed to fetch cluster resources: {}", e))?;

        if !resp.status().is_success() {
            return Err(format!("cluster resources request failed with status: {}", resp.status().as_u16()));
        }

        let json: serde_json::Value = resp.json().await
            .map_err(|e| format!("failed to parse resources response: {}", e))?;
        let data = json.get("data").cloned().unwrap_or(json);
        serde_json::from_value(data).map_err(|e| format!("failed to parse resources response: {}", e))
    }
}

/// Fold cluster resources and local counts into the dashboard statistics
pub fn parse_statistics(resources: &[ClusterResource], node_name: &str, counts: LocalCounts) -> ProxmoxStatistics {
    let mut stats = ProxmoxStatistics {
        number_of_topologies: counts.topologies,
        number_of_scenarios: counts.scenarios,
        number_of_pools: counts.pools,
        number_of_roles: counts.roles,
        ..Default::default()
    };
    let mut node = None;

    for resource in resources {
        match resource.resource_type.as_str() {
            "pool" if resource.pool != "ADMIN" && resource.pool != "SHARED" => stats.users += 1,
            "qemu" if resource.template == 1 => stats.templates += 1,
            "qemu" => stats.vms += 1,
            "node" if resource.node == node_name => node = Some(resource),
            _ => {}
        }
    }

    if let Some(node) = node {
        stats.cpu_usage_percentage = cpu_percentage(node.cpu);
        stats.max_cpu = node.maxcpu;
        stats.memory_used_gib = bytes_to_gib(node.mem);
        stats.memory_total_gib = bytes_to_gib(node.maxmem);
        stats.memory_free_gib = bytes_to_gib(node.maxmem.saturating_sub(node.mem));
        stats.disk_used_gib = bytes_to_gib(node.disk);
        stats.disk_total_gib = bytes_to_gib(node.maxdisk);
        stats.uptime_formatted = format_uptime(node.uptime);
    }

    stats
}

/// Fraction to percent with two decimals; PVE occasionally reports ten times too high
pub fn cpu_percentage(usage: f64) -> f64 {
    let pct = (usage * 10000.0).round() / 100.0;
    if pct > 100.0 { pct / 10.0 } else { pct }
}

pub fn bytes_to_gib(bytes: u64) -> f64 {
    (bytes as f64 / GIB * 100.0).round() / 100.0
}

/// "2w 3d 4h" style; zero parts are dropped, all-zero is "0h"
pub fn format_uptime(seconds: u64) -> String {
    let hours = seconds / 3600;
    let weeks = hours / (24 * 7);
    let days = (hours / 24) % 7;
    let hours = hours % 24;

    let parts: Vec<String> = [(weeks, "w"), (days, "d"), (hours, "h")]
        .iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| format!("{}{}", n, unit))
        .collect();

    if parts.is_empty() { "0h".to_string() } else { parts.join(" ") }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(kind: &str) -> ClusterResource {
        ClusterResource { resource_type: kind.to_string(), ..Default::default() }
    }

    #[test]
    fn uptime_format() {
        assert_eq!(format_uptime(0), "0h");
        assert_eq!(format_uptime(3599), "0h");
        assert_eq!(format_uptime(3 * 3600), "3h");
        assert_eq!(format_uptime(2 * 604800 + 3 * 86400 + 4 * 3600 + 59), "2w 3d 4h");
        assert_eq!(format_uptime(86400), "1d");
    }

    #[test]
    fn cpu_and_memory_rounding() {
        assert_eq!(cpu_percentage(0.123456), 12.35);
        assert_eq!(cpu_percentage(1.5), 15.0);
        assert_eq!(bytes_to_gib(8 * 1024 * 1024 * 1024), 8.0);
        assert_eq!(bytes_to_gib(1536 * 1024 * 1024), 1.5);
    }

    #[test]
    fn counts_resources() {
        let mut resources = vec![
            ClusterResource { pool: "ADMIN".into(), ..resource("pool") },
            ClusterResource { pool: "SHARED".into(), ..resource("pool") },
            ClusterResource { pool: "JD".into(), ..resource("pool") },
            ClusterResource { pool: "BATCHbob".into(), ..resource("pool") },
            ClusterResource { template: 1, ..resource("qemu") },
            resource("qemu"),
            resource("qemu"),
            resource("storage"),
            ClusterResource { node: "other".into(), cpu: 0.9, ..resource("node") },
        ];
        resources.push(ClusterResource {
            node: "ludus".into(),
            cpu: 0.25,
            maxcpu: 32,
            mem: 16 * 1024 * 1024 * 1024,
            maxmem: 64 * 1024 * 1024 * 1024,
            disk: 100 * 1024 * 1024 * 1024,
            maxdisk: 500 * 1024 * 1024 * 1024,
            uptime: 90000,
            ..resource("node")
        });

        let counts = LocalCounts { topologies: 2, scenarios: 1, pools: 3, roles: 7 };
        let stats = parse_statistics(&resources, "ludus", counts);
        assert_eq!(stats.users, 2);
        assert_eq!(stats.templates, 1);
        assert_eq!(stats.vms, 2);
        assert_eq!(stats.cpu_usage_percentage, 25.0);
        assert_eq!(stats.max_cpu, 32);
        assert_eq!(stats.memory_free_gib, 48.0);
        assert_eq!(stats.disk_total_gib, 500.0);
        assert_eq!(stats.uptime_formatted, "1d 1h");
        assert_eq!(stats.number_of_roles, 7);
        assert_eq!(stats.number_of_pools, 3);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["memoryTotalGiB"], 64.0);
        assert_eq!(json["numberOfTopologies"], 2);
        assert_eq!(json["uptimeFormatted"], "1d 1h");
    }

    #[test]
    fn missing_node_leaves_defaults() {
        let stats = parse_statistics(&[resource("qemu")], "ludus", LocalCounts::default());
        assert_eq!(stats.vms, 1);
        assert_eq!(stats.uptime_formatted, "");
        assert_eq!(stats.max_cpu, 0);
    }

    #[test]
    fn resources_parse_from_pve_shape() {
        let data = serde_json::json!([
            {"id": "node/ludus", "type": "node", "node": "ludus", "cpu": 0.1, "maxcpu": 8, "uptime": 10},
            {"id": "qemu/100", "type": "qemu", "vmid": 100, "template": 1, "name": "win11"},
            {"id": "/pool/JD", "type": "pool", "pool": "JD"}
        ]);
        let resources: Vec<ClusterResource> = serde_json::from_value(data).unwrap();
        assert_eq!(resources.len(), 3);
        assert_eq!(resources[1].template, 1);
        assert_eq!(resources[2].pool, "JD");
    }
}
