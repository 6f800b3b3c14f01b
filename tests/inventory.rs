/// Inventory-to-plan integration tests over a fake sysfs tree
use bitwiperz::config::InventoryConfig;
use bitwiperz::crypto::{MemorySecretStore, SignatureAlgorithm};
use bitwiperz::drives::{
    CapabilityProbe, InventorySource, ProbedCapabilities, SelectionReason, SimulatedBackend,
    SysfsInventory,
};
use bitwiperz::wipe_orchestrator::JobState;
use bitwiperz::{Method, Transport, WipeConfig, WipeOrchestrator, WipeResult};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// NVMe drives sanitize, SATA drives secure-erase, everything else neither
struct TableProbe;

impl CapabilityProbe for TableProbe {
    fn probe(&self, _node: &Path, transport: &Transport) -> WipeResult<ProbedCapabilities> {
        Ok(ProbedCapabilities {
            sanitize: *transport == Transport::NVMe,
            secure_erase: *transport == Transport::SATA,
        })
    }
}

fn write_attr(dir: &Path, attr: &str, value: &str) {
    let path = dir.join(attr);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, format!("{}\n", value)).unwrap();
}

fn fake_disk(root: &Path, name: &str, bus_path: &str, model: &str, discard: u64) {
    let device_dir = root.join("sys/devices").join(bus_path).join("block").join(name);
    write_attr(&device_dir, "device/model", model);
    write_attr(&device_dir, "size", "4096");
    write_attr(&device_dir, "queue/discard_max_bytes", &discard.to_string());

    fs::create_dir_all(root.join("sys/block")).unwrap();
    std::os::unix::fs::symlink(&device_dir, root.join("sys/block").join(name)).unwrap();
    fs::create_dir_all(root.join("dev")).unwrap();
    fs::write(root.join("dev").join(name), b"").unwrap();
}

fn fake_host() -> TempDir {
    let root = TempDir::new().unwrap();
    let r = root.path();
    fake_disk(r, "nvme0n1", "pci0000:00/0000:00:1d.0/nvme/nvme0", "Samsung SSD 980 PRO", 1 << 30);
    fake_disk(r, "sda", "pci0000:00/0000:00:17.0/ata1/host0/target0:0:0/0:0:0:0", "Crucial MX500", 1 << 30);
    fake_disk(r, "sdb", "pci0000:00/0000:00:14.0/usb2/2-1/2-1:1.0/host4", "Cruzer Blade", 0);
    fake_disk(r, "vda", "pci0000:00/0000:00:04.0/virtio1", "", 0);
    fake_disk(r, "loop0", "virtual", "", 0);
    fake_disk(r, "dm-0", "virtual", "", 0);
    root
}

fn config(root: &Path, exclude: &[&str]) -> WipeConfig {
    let mut config = WipeConfig::default();
    config.inventory = InventoryConfig {
        sysfs_root: root.join("sys"),
        dev_root: root.join("dev"),
        exclude: exclude.iter().map(|s| s.to_string()).collect(),
    };
    config.verification.sample_regions = 8;
    config.execution.precheck_base_delay_ms = 0;
    config.execution.precheck_max_delay_ms = 0;
    config
}

fn orchestrator(config: WipeConfig) -> WipeOrchestrator {
    let inventory = SysfsInventory::with_probe(&config.inventory, Arc::new(TableProbe));
    let store = MemorySecretStore::generated(
        config.certificate.key_id.clone(),
        SignatureAlgorithm::Ed25519,
    )
    .unwrap();

    WipeOrchestrator::builder(config)
        .inventory(Arc::new(inventory))
        .simulated(Arc::new(SimulatedBackend::instant()))
        .secret_store(Arc::new(store))
        .build()
        .unwrap()
}

#[test]
fn test_virtual_devices_never_reach_the_plan() {
    let host = fake_host();
    let inventory = SysfsInventory::with_probe(&config(host.path(), &[]).inventory, Arc::new(TableProbe));

    let ids: Vec<String> = inventory
        .scan()
        .unwrap()
        .iter()
        .map(|d| d.id().to_string())
        .collect();
    assert_eq!(ids, vec!["nvme0n1", "sda", "sdb", "vda"]);
}

#[test]
fn test_plan_from_sysfs() {
    let host = fake_host();
    let orchestrator = orchestrator(config(host.path(), &[]));
    let snapshot = orchestrator.enumerate().unwrap();

    let plan = orchestrator.plan(&snapshot);
    let chosen: Vec<(&str, Method, SelectionReason)> = plan
        .iter()
        .map(|p| (p.device_id.as_str(), p.method, p.reason))
        .collect();

    assert_eq!(
        chosen,
        vec![
            ("nvme0n1", Method::NvmeSanitize, SelectionReason::NativePurge),
            ("sda", Method::AtaSecureErase, SelectionReason::NativePurge),
            ("sdb", Method::SinglePassOverwrite, SelectionReason::Fallback),
            ("vda", Method::SinglePassOverwrite, SelectionReason::UndecodableTransport),
        ]
    );
    assert_eq!(plan[3].transport, Transport::Unknown("vda".to_string()));
    assert!(plan[3].note.as_deref().unwrap().contains("undecodable transport"));
}

#[test]
fn test_plan_serializes_camel_case() {
    let host = fake_host();
    let orchestrator = orchestrator(config(host.path(), &[]));
    let plan = orchestrator.plan(&orchestrator.enumerate().unwrap());

    let json = serde_json::to_value(&plan).unwrap();
    assert_eq!(json[0]["deviceId"], "nvme0n1");
    assert_eq!(json[0]["method"], "nvme-sanitize");
    assert_eq!(json[0]["displayName"], "Samsung SSD 980 PRO");
}

#[tokio::test]
async fn test_wipe_all_except_excluded() {
    let host = fake_host();
    let orchestrator = orchestrator(config(host.path(), &["sda"]));
    let snapshot = orchestrator.enumerate().unwrap();
    assert!(snapshot.find("sda").is_none());

    let reports = orchestrator.run_all(snapshot.devices()).await;
    assert_eq!(reports.len(), 3);
    for report in reports {
        let report = report.unwrap();
        assert_eq!(report.job.state(), JobState::Done, "{}", report.job.device_id());
        assert!(report.certificate().is_some());
    }
}
