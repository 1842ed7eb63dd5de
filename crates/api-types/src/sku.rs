//! Static GPU instance-type catalog.
//!
//! Read-only input used to validate requested instance types before any
//! provisioning happens. Memory figures are per-instance totals in GiB.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuSku {
    pub name: &'static str,
    pub gpu_count: u32,
    pub gpu_memory_gb: u32,
    pub supported_os: &'static [&'static str],
}

const UBUNTU: &[&str] = &["Ubuntu"];
const UBUNTU_MARINER: &[&str] = &["Mariner", "Ubuntu"];
const AMAZON_LINUX: &[&str] = &["AmazonLinux2"];

const SKUS: &[GpuSku] = &[
    // Azure N-series
    GpuSku { name: "standard_nc6", gpu_count: 1, gpu_memory_gb: 12, supported_os: UBUNTU },
    GpuSku { name: "standard_nc12", gpu_count: 2, gpu_memory_gb: 24, supported_os: UBUNTU },
    GpuSku { name: "standard_nc24", gpu_count: 4, gpu_memory_gb: 48, supported_os: UBUNTU },
    GpuSku { name: "standard_nv6", gpu_count: 1, gpu_memory_gb: 8, supported_os: UBUNTU },
    GpuSku { name: "standard_nv12", gpu_count: 2, gpu_memory_gb: 16, supported_os: UBUNTU },
    GpuSku { name: "standard_nd6s", gpu_count: 1, gpu_memory_gb: 24, supported_os: UBUNTU },
    GpuSku { name: "standard_nd12s", gpu_count: 2, gpu_memory_gb: 48, supported_os: UBUNTU },
    GpuSku { name: "standard_nc6s_v3", gpu_count: 1, gpu_memory_gb: 16, supported_os: UBUNTU_MARINER },
    GpuSku { name: "standard_nc12s_v3", gpu_count: 2, gpu_memory_gb: 32, supported_os: UBUNTU_MARINER },
    GpuSku { name: "standard_nc24s_v3", gpu_count: 4, gpu_memory_gb: 64, supported_os: UBUNTU_MARINER },
    GpuSku { name: "standard_nc4as_t4_v3", gpu_count: 1, gpu_memory_gb: 16, supported_os: UBUNTU_MARINER },
    GpuSku { name: "standard_nc8as_t4_v3", gpu_count: 1, gpu_memory_gb: 16, supported_os: UBUNTU_MARINER },
    GpuSku { name: "standard_nc16as_t4_v3", gpu_count: 1, gpu_memory_gb: 16, supported_os: UBUNTU_MARINER },
    GpuSku { name: "standard_nc64as_t4_v3", gpu_count: 4, gpu_memory_gb: 64, supported_os: UBUNTU_MARINER },
    GpuSku { name: "standard_nd40rs_v2", gpu_count: 8, gpu_memory_gb: 256, supported_os: UBUNTU_MARINER },
    GpuSku { name: "standard_nc24ads_a100_v4", gpu_count: 1, gpu_memory_gb: 80, supported_os: UBUNTU },
    GpuSku { name: "standard_nc48ads_a100_v4", gpu_count: 2, gpu_memory_gb: 160, supported_os: UBUNTU },
    GpuSku { name: "standard_nc96ads_a100_v4", gpu_count: 4, gpu_memory_gb: 320, supported_os: UBUNTU },
    GpuSku { name: "standard_nd96asr_v4", gpu_count: 8, gpu_memory_gb: 320, supported_os: UBUNTU },
    GpuSku { name: "standard_nd96amsr_a100_v4", gpu_count: 8, gpu_memory_gb: 640, supported_os: UBUNTU },
    // AWS accelerated instances
    GpuSku { name: "p2.xlarge", gpu_count: 1, gpu_memory_gb: 12, supported_os: AMAZON_LINUX },
    GpuSku { name: "p3.2xlarge", gpu_count: 1, gpu_memory_gb: 16, supported_os: AMAZON_LINUX },
    GpuSku { name: "p3.8xlarge", gpu_count: 4, gpu_memory_gb: 64, supported_os: AMAZON_LINUX },
    GpuSku { name: "p3.16xlarge", gpu_count: 8, gpu_memory_gb: 128, supported_os: AMAZON_LINUX },
    GpuSku { name: "p4d.24xlarge", gpu_count: 8, gpu_memory_gb: 320, supported_os: AMAZON_LINUX },
    GpuSku { name: "g4dn.xlarge", gpu_count: 1, gpu_memory_gb: 16, supported_os: AMAZON_LINUX },
    GpuSku { name: "g5.xlarge", gpu_count: 1, gpu_memory_gb: 24, supported_os: AMAZON_LINUX },
    GpuSku { name: "g5.12xlarge", gpu_count: 4, gpu_memory_gb: 96, supported_os: AMAZON_LINUX },
];

static BY_NAME: Lazy<BTreeMap<&'static str, &'static GpuSku>> =
    Lazy::new(|| SKUS.iter().map(|sku| (sku.name, sku)).collect());

/// Looks up an instance type, case-insensitively.
pub fn lookup(instance_type: &str) -> Option<&'static GpuSku> {
    BY_NAME.get(instance_type.to_lowercase().as_str()).copied()
}

/// Comma-separated list of every supported instance type, for messages.
pub fn supported_skus() -> String {
    SKUS.iter().map(|s| s.name).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let sku = lookup("Standard_NC24ads_A100_v4").unwrap();
        assert_eq!(sku.gpu_count, 1);
        assert_eq!(sku.gpu_memory_gb, 80);
    }

    #[test]
    fn unknown_instance_type_is_rejected() {
        assert!(lookup("standard_d2s_v3").is_none());
    }

    #[test]
    fn supported_skus_mentions_both_clouds() {
        let all = supported_skus();
        assert!(all.contains("standard_nc6"));
        assert!(all.contains("p3.2xlarge"));
    }
}
