//! DUT, host, and CI information blocks attached to a run record.

use std::fs;
use std::net::UdpSocket;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DutInformation {
    #[serde(default)]
    pub vendor_name: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    pub product_id: u32,
    pub vendor_id: u32,
    #[serde(default)]
    pub software_version: Option<String>,
    #[serde(default)]
    pub hardware_version: Option<String>,
    #[serde(default = "default_serial_number")]
    pub serial_number: String,
}

fn default_serial_number() -> String {
    "1234".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInformation {
    pub host_name: String,
    pub ip_address: String,
    pub mac_address: String,
}

/// CI job metadata. Every field is optional; absent fields are omitted from
/// the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiInformation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_job_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_job_build_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_ws_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_sdk_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apps_sdk_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_sdk_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_sdk_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_sdk_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_sdk_pr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_apps_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_apps_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_apps_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_apps_pr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_to_test: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_qa_repo_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_qa_repo_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_qa_repo_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_qa_repo_pr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qa_repo_git_sha: Option<String>,
}

impl CiInformation {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ---------------------------------------------------------------------------
// Host discovery
// ---------------------------------------------------------------------------

/// Collect hostname, primary IP and MAC address of the controller host.
///
/// Never fails; unknown fields fall back to placeholder values.
pub fn discover_host() -> HostInformation {
    let host_name = read_hostname().unwrap_or_else(|| "unknown".to_string());
    let ip_address = primary_ip().unwrap_or_else(|| "0.0.0.0".to_string());
    let mac_address = primary_mac(Path::new("/sys/class/net"))
        .unwrap_or_else(|| "00:00:00:00:00:00".to_string());
    debug!(%host_name, %ip_address, %mac_address, "discovered host information");
    HostInformation {
        host_name,
        ip_address,
        mac_address,
    }
}

fn read_hostname() -> Option<String> {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
}

/// Source address the kernel would pick for outbound traffic. No packet is
/// sent; connecting a UDP socket only resolves the route.
fn primary_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    if let Err(e) = socket.connect("8.8.8.8:80") {
        warn!(error = %e, "no default route, cannot determine host IP");
        return None;
    }
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

/// First non-loopback interface under `sysfs_net` with a non-zero address.
fn primary_mac(sysfs_net: &Path) -> Option<String> {
    let mut entries: Vec<_> = fs::read_dir(sysfs_net).ok()?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if entry.file_name() == "lo" {
            continue;
        }
        let Ok(addr) = fs::read_to_string(entry.path().join("address")) else {
            continue;
        };
        let addr = addr.trim();
        if !addr.is_empty() && addr != "00:00:00:00:00:00" {
            return Some(addr.to_string());
        }
    }
    None
}
