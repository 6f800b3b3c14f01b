/// Tests for device command output parsing and host pre-check helpers

#[cfg(test)]
mod command_parser_tests {
    use super::super::command::*;
    use super::super::SanitizeBackend;
    use crate::config::ExecutionConfig;
    use crate::{CapabilityFlags, Device, Method, Transport, WipeError};
    use std::fs;
    use std::path::Path;

    const ID_CTRL: &str = "\
NVME Identify Controller:
vid       : 0x144d
ssvid     : 0x144d
sn        : S4EWNX0R123456
mn        : Samsung SSD 980 PRO 1TB
sanicap   : 0x3
hmminds   : 0
";

    const SANITIZE_LOG_RUNNING: &str = "\
Sanitize Progress                      (SPROG) :  32768
Sanitize Status                        (SSTAT) :  0x2
Sanitize Command Dword 10 Information (SCDW10) :  0x2
";

    const SANITIZE_LOG_DONE: &str = "\
Sanitize Progress                      (SPROG) :  65535
Sanitize Status                        (SSTAT) :  0x101
";

    const HDPARM_SECURITY: &str = "\
Commands/features:
	Enabled	Supported:
	   *	SMART feature set
Security:
	Master password revision code = 65534
		supported
	not	enabled
	not	locked
		frozen
	not	expired: security count
		supported: enhanced erase
	2min for SECURITY ERASE UNIT. 8min for ENHANCED SECURITY ERASE UNIT.
Logical Unit WWN Device Identifier: 5002538e40000000
";

    #[test]
    fn test_parse_sanicap_hex() {
        assert_eq!(parse_sanicap(ID_CTRL), Some(0x3));
    }

    #[test]
    fn test_parse_sanicap_missing() {
        assert_eq!(parse_sanicap("vid : 0x144d\n"), None);
    }

    #[test]
    fn test_sanitize_action_prefers_block_erase() {
        assert_eq!(sanitize_action(0x3), Some(2));
        assert_eq!(sanitize_action(0x1), Some(4));
        assert_eq!(sanitize_action(0x4), Some(3));
        assert_eq!(sanitize_action(0x0), None);
    }

    #[test]
    fn test_sanicap_support_ignores_high_bits() {
        assert!(!sanicap_supports_sanitize(0x6000_0000));
        assert!(sanicap_supports_sanitize(0x6000_0002));
    }

    #[test]
    fn test_parse_sanitize_log_in_progress() {
        let status = parse_sanitize_log(SANITIZE_LOG_RUNNING).unwrap();
        assert_eq!(status.state, SanitizeState::InProgress);
        assert_eq!(status.percent, 50);
    }

    #[test]
    fn test_parse_sanitize_log_completed() {
        let status = parse_sanitize_log(SANITIZE_LOG_DONE).unwrap();
        assert_eq!(status.state, SanitizeState::Completed);
        assert!(status.state.is_success());
        assert_eq!(status.percent, 100);
    }

    #[test]
    fn test_parse_sanitize_log_failed() {
        let log = "Sanitize Status (SSTAT) :  0x3\n";
        let status = parse_sanitize_log(log).unwrap();
        assert_eq!(status.state, SanitizeState::Failed);
        assert!(!status.state.is_success());
    }

    #[test]
    fn test_parse_sanitize_log_without_status() {
        assert!(parse_sanitize_log("garbage").is_none());
    }

    #[test]
    fn test_parse_ata_security() {
        let security = parse_ata_security(HDPARM_SECURITY).unwrap();

        assert!(security.supported);
        assert!(!security.enabled);
        assert!(!security.locked);
        assert!(security.frozen);
        assert!(security.enhanced_erase);
        assert_eq!(security.erase_minutes, Some(2));
        assert_eq!(security.enhanced_erase_minutes, Some(8));
    }

    #[test]
    fn test_parse_ata_security_not_frozen() {
        let output = HDPARM_SECURITY.replace("\t\tfrozen", "\tnot\tfrozen");
        assert!(!parse_ata_security(&output).unwrap().frozen);
    }

    #[test]
    fn test_parse_ata_security_long_estimates() {
        let output = HDPARM_SECURITY.replace(
            "2min for SECURITY ERASE UNIT. 8min for ENHANCED SECURITY ERASE UNIT.",
            "more than 508min for SECURITY ERASE UNIT.",
        );
        let security = parse_ata_security(&output).unwrap();

        assert_eq!(security.erase_minutes, Some(508));
        assert_eq!(security.enhanced_erase_minutes, None);
    }

    #[test]
    fn test_parse_ata_security_missing_section() {
        assert!(parse_ata_security("Model Number: USB Stick\n").is_none());
    }

    #[test]
    fn test_is_mounted_matches_partitions() {
        let mounts = "/dev/sda1 / ext4 rw 0 0\nproc /proc proc rw 0 0\n";
        assert!(is_mounted_in(mounts, Path::new("/dev/sda")));
        assert!(!is_mounted_in(mounts, Path::new("/dev/sdb")));
    }

    #[test]
    fn test_is_swap_in_skips_header() {
        let swaps = "Filename\t\t\t\tType\t\tSize\t\tUsed\tPriority\n\
                     /dev/sdb2                               partition\t8388604\t\t0\t-2\n";
        assert!(is_swap_in(swaps, Path::new("/dev/sdb")));
        assert!(!is_swap_in(swaps, Path::new("/dev/sda")));
        assert!(!is_swap_in("Filename Type Size Used Priority\n", Path::new("/dev/sdb")));
    }

    #[test]
    fn test_block_holders_on_disk_and_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let sda = dir.path().join("block/sda");
        fs::create_dir_all(sda.join("holders")).unwrap();
        fs::create_dir_all(sda.join("sda1/holders/dm-0")).unwrap();
        fs::create_dir_all(sda.join("sda2/holders/md127")).unwrap();
        fs::create_dir_all(sda.join("queue")).unwrap();

        assert_eq!(block_holders(&sda), vec!["dm-0".to_string(), "md127".to_string()]);
    }

    #[test]
    fn test_block_holders_free_disk() {
        let dir = tempfile::tempdir().unwrap();
        let sdb = dir.path().join("block/sdb");
        fs::create_dir_all(sdb.join("holders")).unwrap();
        fs::create_dir_all(sdb.join("sdb1/holders")).unwrap();

        assert!(block_holders(&sdb).is_empty());
        assert!(block_holders(&dir.path().join("block/missing")).is_empty());
    }

    #[test]
    fn test_pre_check_refuses_held_disk() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("dev/sdq");
        fs::create_dir_all(node.parent().unwrap()).unwrap();
        fs::write(&node, b"").unwrap();
        let sys = dir.path().join("sys");
        fs::create_dir_all(sys.join("block/sdq/holders/dm-3")).unwrap();

        let config = ExecutionConfig {
            require_ac_power: false,
            ..Default::default()
        };
        let backend = CommandBackend::new(config, &sys);
        let device = Device::new("sdq", "Held Disk", &node, Transport::SATA, CapabilityFlags::default(), 4096);

        let error = backend
            .pre_check(&device, Method::SinglePassOverwrite)
            .unwrap_err();
        assert!(error.to_string().contains("in use by dm-3"), "{}", error);

        fs::remove_dir(sys.join("block/sdq/holders/dm-3")).unwrap();
        assert!(backend.pre_check(&device, Method::SinglePassOverwrite).is_ok());
    }

    #[test]
    fn test_interrupted_erase_names_password_when_still_set() {
        let cause = WipeError::Execution("hdparm --security-erase exited with 5".to_string());

        let stuck = interrupted_erase_error("/dev/sda", &cause, false).to_string();
        assert!(stuck.contains("exited with 5"));
        assert!(stuck.contains(&format!("--security-disable {} /dev/sda", ATA_ERASE_PASSWORD)));

        let cleared = interrupted_erase_error("/dev/sda", &cause, true).to_string();
        assert!(cleared.contains("security password cleared"));
        assert!(!cleared.contains(ATA_ERASE_PASSWORD));
    }

    fn power_supply(dir: &Path, name: &str, kind: &str, online: Option<&str>) {
        let supply = dir.join(name);
        fs::create_dir_all(&supply).unwrap();
        fs::write(supply.join("type"), format!("{}\n", kind)).unwrap();
        if let Some(online) = online {
            fs::write(supply.join("online"), format!("{}\n", online)).unwrap();
        }
    }

    #[test]
    fn test_mains_power_without_battery() {
        let dir = tempfile::tempdir().unwrap();
        assert!(on_mains_power(dir.path()));
        assert!(on_mains_power(&dir.path().join("missing")));
    }

    #[test]
    fn test_battery_only_is_not_mains() {
        let dir = tempfile::tempdir().unwrap();
        power_supply(dir.path(), "BAT0", "Battery", None);
        power_supply(dir.path(), "AC", "Mains", Some("0"));
        assert!(!on_mains_power(dir.path()));
    }

    #[test]
    fn test_laptop_on_ac() {
        let dir = tempfile::tempdir().unwrap();
        power_supply(dir.path(), "BAT0", "Battery", None);
        power_supply(dir.path(), "AC", "Mains", Some("1"));
        assert!(on_mains_power(dir.path()));
    }
}
