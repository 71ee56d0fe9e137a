//! Host metrics and system description

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use sysinfo::{Disks, System};

use es_core::traits::MetricsSampler;
use es_core::types::RegisterRequest;
use es_core::{AgentId, MetricsSnapshot};

/// Samples CPU, memory and root filesystem utilisation with sysinfo.
///
/// CPU usage is a delta between refreshes, so the first sample after
/// construction may read low.
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler for SystemSampler {
    fn sample(&self) -> MetricsSnapshot {
        let (cpu_usage, mem_usage) = {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                f64::from(system.global_cpu_usage()),
                percent(system.used_memory(), system.total_memory()),
            )
        };

        MetricsSnapshot {
            cpu_usage,
            mem_usage,
            disk_usage: root_disk_usage(),
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Usage of the filesystem mounted at `/`, or of the first disk listed
fn root_disk_usage() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().first());

    match disk {
        Some(disk) => percent(
            disk.total_space().saturating_sub(disk.available_space()),
            disk.total_space(),
        ),
        None => 0.0,
    }
}

/// Static description of this host, reported at registration
#[derive(Debug, Clone, PartialEq)]
pub struct SystemInfo {
    pub hostname: String,
    pub ip: String,
    pub os: String,
    pub arch: String,
    pub kernel: String,
    pub cpu_model: String,
    pub cpu_cores: usize,
    /// Bytes
    pub mem_total: u64,
}

impl SystemInfo {
    pub fn register_request(&self, agent_id: &AgentId, agent_version: &str) -> RegisterRequest {
        RegisterRequest {
            agent_id: agent_id.clone(),
            hostname: self.hostname.clone(),
            ip: self.ip.clone(),
            os: self.os.clone(),
            arch: self.arch.clone(),
            kernel: self.kernel.clone(),
            cpu_model: self.cpu_model.clone(),
            cpu_cores: self.cpu_cores,
            mem_total: self.mem_total,
            agent_version: agent_version.to_string(),
        }
    }
}

/// Collect the host description
pub fn collect_system_info() -> SystemInfo {
    let mut system = System::new();
    system.refresh_cpu_all();
    system.refresh_memory();

    SystemInfo {
        hostname: hostname(),
        ip: local_ip().to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        kernel: System::kernel_version().unwrap_or_default(),
        cpu_model: system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .unwrap_or_default(),
        cpu_cores: system.cpus().len(),
        mem_total: system.total_memory(),
    }
}

/// This machine's hostname, lossily decoded
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Address of the interface used for outbound traffic, or loopback.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel which
/// source address it would route from.
pub fn local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified() && !ip.is_loopback())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
