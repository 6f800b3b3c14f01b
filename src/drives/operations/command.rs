use super::overwrite;
use super::{Attestation, SanitizeBackend, SelfReport};
use crate::config::ExecutionConfig;
use crate::{Device, Method, Transport, WipeError, WipeResult};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

/// Temporary ATA user password. Fixed so an interrupted erase can be unlocked.
pub const ATA_ERASE_PASSWORD: &str = "bitwiperz";

// SANICAP bits (NVMe Identify Controller)
const SANICAP_CRYPTO_ERASE: u32 = 1 << 0;
const SANICAP_BLOCK_ERASE: u32 = 1 << 1;
const SANICAP_OVERWRITE: u32 = 1 << 2;

/// Parse the SANICAP field from `nvme id-ctrl` output
pub fn parse_sanicap(id_ctrl: &str) -> Option<u32> {
    id_ctrl
        .lines()
        .find(|line| line.trim_start().starts_with("sanicap"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|value| parse_number(value.trim()))
}

/// Whether SANICAP advertises any sanitize operation
pub fn sanicap_supports_sanitize(sanicap: u32) -> bool {
    sanicap & (SANICAP_CRYPTO_ERASE | SANICAP_BLOCK_ERASE | SANICAP_OVERWRITE) != 0
}

/// Sanitize action for `nvme sanitize --sanact`: block erase preferred,
/// then crypto erase, then overwrite
pub fn sanitize_action(sanicap: u32) -> Option<u8> {
    if sanicap & SANICAP_BLOCK_ERASE != 0 {
        Some(2)
    } else if sanicap & SANICAP_CRYPTO_ERASE != 0 {
        Some(4)
    } else if sanicap & SANICAP_OVERWRITE != 0 {
        Some(3)
    } else {
        None
    }
}

fn parse_number(raw: &str) -> Option<u32> {
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeState {
    NeverSanitized,
    Completed,
    InProgress,
    Failed,
    CompletedWithoutDeallocate,
    Unknown(u32),
}

impl SanitizeState {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SanitizeState::Completed | SanitizeState::CompletedWithoutDeallocate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeStatus {
    pub state: SanitizeState,
    /// Progress of the running operation in percent
    pub percent: u8,
}

/// Parse SPROG and SSTAT from `nvme sanitize-log` output
pub fn parse_sanitize_log(output: &str) -> Option<SanitizeStatus> {
    let field = |tag: &str| {
        output
            .lines()
            .find(|line| line.contains(tag))
            .and_then(|line| line.rsplit(':').next())
            .and_then(|value| parse_number(value.trim()))
    };

    let sstat = field("(SSTAT)")?;
    let sprog = field("(SPROG)").unwrap_or(0);

    let state = match sstat & 0x7 {
        0 => SanitizeState::NeverSanitized,
        1 => SanitizeState::Completed,
        2 => SanitizeState::InProgress,
        3 => SanitizeState::Failed,
        4 => SanitizeState::CompletedWithoutDeallocate,
        other => SanitizeState::Unknown(other),
    };
    let percent = if state.is_success() {
        100
    } else {
        (sprog.min(65535) * 100 / 65536) as u8
    };

    Some(SanitizeStatus { state, percent })
}

/// ATA security feature set as reported by `hdparm -I`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtaSecurity {
    pub supported: bool,
    pub enabled: bool,
    pub locked: bool,
    pub frozen: bool,
    pub enhanced_erase: bool,
    /// Drive's own estimate for SECURITY ERASE UNIT
    pub erase_minutes: Option<u32>,
    pub enhanced_erase_minutes: Option<u32>,
}

/// Matches `2min for SECURITY ERASE UNIT` and `more than 508min for ENHANCED SECURITY ERASE UNIT`
fn erase_estimate_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\d+)\s*min for (ENHANCED )?SECURITY ERASE UNIT").ok())
        .as_ref()
}

/// Parse the `Security:` section of `hdparm -I` output
pub fn parse_ata_security(output: &str) -> Option<AtaSecurity> {
    let mut lines = output.lines().skip_while(|l| l.trim() != "Security:");
    lines.next()?;

    let mut security = AtaSecurity::default();
    for line in lines {
        if !line.starts_with(char::is_whitespace) {
            break;
        }
        let line = line.trim();
        let (negated, item) = match line.strip_prefix("not") {
            Some(rest) => (true, rest.trim()),
            None => (false, line),
        };

        match item {
            "supported" => security.supported = !negated,
            "enabled" => security.enabled = !negated,
            "locked" => security.locked = !negated,
            "frozen" => security.frozen = !negated,
            "supported: enhanced erase" => security.enhanced_erase = !negated,
            _ if item.contains("SECURITY ERASE UNIT") => {
                let Some(pattern) = erase_estimate_pattern() else {
                    continue;
                };
                for caps in pattern.captures_iter(item) {
                    let minutes = caps[1].parse::<u32>().ok();
                    if caps.get(2).is_some() {
                        security.enhanced_erase_minutes = minutes;
                    } else {
                        security.erase_minutes = minutes;
                    }
                }
            }
            _ => {}
        }
    }
    Some(security)
}

/// Whether `node` or one of its partitions appears in a mounts table
pub fn is_mounted_in(mounts: &str, node: &Path) -> bool {
    let node = node.to_string_lossy();
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|source| source.starts_with(node.as_ref()))
}

/// Whether the machine is on mains power, judged from a power_supply class
/// directory. Machines without any battery count as mains powered.
pub fn on_mains_power(power_supply_dir: &Path) -> bool {
    let entries = match fs::read_dir(power_supply_dir) {
        Ok(entries) => entries,
        Err(_) => return true,
    };

    let mut saw_battery = false;
    for entry in entries.flatten() {
        let path = entry.path();
        let kind = read_trimmed(&path.join("type")).unwrap_or_default();
        match kind.as_str() {
            "Mains" | "USB" => {
                if read_trimmed(&path.join("online")).as_deref() == Some("1") {
                    return true;
                }
            }
            "Battery" => saw_battery = true,
            _ => {}
        }
    }
    !saw_battery
}

/// Whether `node` or one of its partitions is an active swap area in a
/// `/proc/swaps` table
pub fn is_swap_in(swaps: &str, node: &Path) -> bool {
    let node = node.to_string_lossy();
    swaps
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .any(|source| source.starts_with(node.as_ref()))
}

/// Kernel devices stacked on a disk or its partitions (device-mapper, LVM,
/// md), read from the `holders` directories under `block_dir`
pub fn block_holders(block_dir: &Path) -> Vec<String> {
    let name = block_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut dirs = vec![block_dir.to_path_buf()];
    if let Ok(entries) = fs::read_dir(block_dir) {
        dirs.extend(
            entries
                .flatten()
                .filter(|e| !name.is_empty() && e.file_name().to_string_lossy().starts_with(&name))
                .map(|e| e.path()),
        );
    }

    let mut holders: Vec<String> = dirs
        .iter()
        .filter_map(|dir| fs::read_dir(dir.join("holders")).ok())
        .flat_map(|entries| entries.flatten())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    holders.sort();
    holders.dedup();
    holders
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn run(program: &str, args: &[&str]) -> WipeResult<Output> {
    tracing::debug!(program, ?args, "Running device command");
    Command::new(program)
        .args(args)
        .output()
        .map_err(|e| WipeError::Io(format!("failed to run {}: {}", program, e)))
}

fn run_checked(program: &str, args: &[&str]) -> WipeResult<String> {
    let output = run(program, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WipeError::Execution(format!(
            "{} {} failed: {}",
            program,
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Backend that drives real hardware through nvme-cli, hdparm and blkdiscard
pub struct CommandBackend {
    config: ExecutionConfig,
    mounts_path: PathBuf,
    swaps_path: PathBuf,
    sysfs_block_dir: PathBuf,
    power_supply_dir: PathBuf,
}

impl CommandBackend {
    pub fn new(config: ExecutionConfig, sysfs_root: &Path) -> Self {
        Self {
            config,
            mounts_path: PathBuf::from("/proc/mounts"),
            swaps_path: PathBuf::from("/proc/swaps"),
            sysfs_block_dir: sysfs_root.join("block"),
            power_supply_dir: sysfs_root.join("class/power_supply"),
        }
    }

    /// Refuse devices the running system still uses: mounted, swapped on,
    /// or held by a stacked device
    fn check_not_in_use(&self, device: &Device) -> WipeResult<()> {
        let node = Self::node(device);

        let mounts = fs::read_to_string(&self.mounts_path)?;
        if is_mounted_in(&mounts, device.node()) {
            return Err(WipeError::Execution(format!(
                "{} or one of its partitions is mounted",
                node
            )));
        }

        // Missing on kernels without swap support
        let swaps = fs::read_to_string(&self.swaps_path).unwrap_or_default();
        if is_swap_in(&swaps, device.node()) {
            return Err(WipeError::Execution(format!(
                "{} or one of its partitions is active swap",
                node
            )));
        }

        if let Some(name) = device.node().file_name() {
            let holders = block_holders(&self.sysfs_block_dir.join(name));
            if !holders.is_empty() {
                return Err(WipeError::Execution(format!(
                    "{} is in use by {}",
                    node,
                    holders.join(", ")
                )));
            }
        }
        Ok(())
    }

    fn node(device: &Device) -> String {
        device.node().to_string_lossy().into_owned()
    }

    fn sanicap(node: &str) -> WipeResult<u32> {
        let output = run_checked("nvme", &["id-ctrl", node])?;
        parse_sanicap(&output).ok_or_else(|| {
            WipeError::Execution(format!("no SANICAP field in id-ctrl output for {}", node))
        })
    }

    fn ata_security(node: &str) -> WipeResult<AtaSecurity> {
        let output = run_checked("hdparm", &["-I", node])?;
        parse_ata_security(&output).ok_or_else(|| {
            WipeError::Execution(format!("no security section in hdparm output for {}", node))
        })
    }

    fn sanitize_status(node: &str) -> WipeResult<SanitizeStatus> {
        let output = run_checked("nvme", &["sanitize-log", node])?;
        parse_sanitize_log(&output).ok_or_else(|| {
            WipeError::Execution(format!("unreadable sanitize log for {}", node))
        })
    }

    fn nvme_sanitize(&self, node: &str, progress: &mut dyn FnMut(u8)) -> WipeResult<()> {
        let action = sanitize_action(Self::sanicap(node)?).ok_or_else(|| {
            WipeError::Execution(format!("{} advertises no sanitize action", node))
        })?;
        let sanact = format!("--sanact={}", action);
        run_checked("nvme", &["sanitize", node, &sanact])?;
        tracing::info!(device = node, sanact = action, "NVMe sanitize started");

        loop {
            thread::sleep(self.config.poll_interval());
            let status = Self::sanitize_status(node)?;
            match status.state {
                SanitizeState::InProgress => progress(status.percent),
                state if state.is_success() => {
                    progress(100);
                    return Ok(());
                }
                SanitizeState::Failed => {
                    return Err(WipeError::Execution(format!(
                        "device reported sanitize failure on {}",
                        node
                    )))
                }
                other => {
                    return Err(WipeError::Execution(format!(
                        "unexpected sanitize state {:?} on {}",
                        other, node
                    )))
                }
            }
        }
    }

    fn ata_secure_erase(&self, node: &str, progress: &mut dyn FnMut(u8)) -> WipeResult<()> {
        let security = Self::ata_security(node)?;
        let (erase_flag, minutes) = if security.enhanced_erase {
            ("--security-erase-enhanced", security.enhanced_erase_minutes)
        } else {
            ("--security-erase", security.erase_minutes)
        };
        let estimate = Duration::from_secs(u64::from(minutes.unwrap_or(2).max(1)) * 60);

        run_checked(
            "hdparm",
            &["--user-master", "u", "--security-set-pass", ATA_ERASE_PASSWORD, node],
        )?;

        match self.run_security_erase(node, erase_flag, estimate, progress) {
            Ok(()) => Ok(()),
            Err(error) => {
                let released = run_checked(
                    "hdparm",
                    &["--user-master", "u", "--security-disable", ATA_ERASE_PASSWORD, node],
                )
                .is_ok();
                tracing::error!(device = node, %error, released, "ATA secure erase failed");
                Err(interrupted_erase_error(node, &error, released))
            }
        }
    }

    fn run_security_erase(
        &self,
        node: &str,
        erase_flag: &str,
        estimate: Duration,
        progress: &mut dyn FnMut(u8),
    ) -> WipeResult<()> {
        let mut process = Command::new("hdparm")
            .args(["--user-master", "u", erase_flag, ATA_ERASE_PASSWORD, node])
            .spawn()
            .map_err(|e| WipeError::Io(format!("failed to run hdparm: {}", e)))?;
        tracing::info!(device = node, erase = erase_flag, "ATA secure erase started");

        let started = Instant::now();
        loop {
            match process.try_wait()? {
                Some(status) if status.success() => {
                    progress(100);
                    return Ok(());
                }
                Some(status) => {
                    return Err(WipeError::Execution(format!(
                        "hdparm {} exited with {}",
                        erase_flag, status
                    )))
                }
                None => {
                    // The drive gives no progress; estimate from its own timing
                    let fraction = started.elapsed().as_secs_f64() / estimate.as_secs_f64();
                    progress((fraction * 100.0).min(99.0) as u8);
                    thread::sleep(self.config.poll_interval());
                }
            }
        }
    }
}

/// Error for an erase that failed after the temporary user password was set.
/// When the password could not be cleared the message says how to unlock.
pub fn interrupted_erase_error(node: &str, cause: &WipeError, released: bool) -> WipeError {
    let cause = match cause {
        WipeError::Execution(message) | WipeError::Io(message) => message.clone(),
        other => other.to_string(),
    };
    if released {
        WipeError::Execution(format!("{}; security password cleared on {}", cause, node))
    } else {
        WipeError::Execution(format!(
            "{}; {} may still hold user password '{}', unlock with \
             `hdparm --user-master u --security-disable {} {}`",
            cause, node, ATA_ERASE_PASSWORD, ATA_ERASE_PASSWORD, node
        ))
    }
}

impl SanitizeBackend for CommandBackend {
    fn pre_check(&self, device: &Device, method: Method) -> WipeResult<()> {
        let node = Self::node(device);
        if !device.node().exists() {
            return Err(WipeError::Io(format!("device node {} not found", node)));
        }

        self.check_not_in_use(device)?;

        if self.config.require_ac_power && !on_mains_power(&self.power_supply_dir) {
            return Err(WipeError::Execution(
                "system is running on battery power".to_string(),
            ));
        }

        match method {
            Method::NvmeSanitize => {
                if !sanicap_supports_sanitize(Self::sanicap(&node)?) {
                    return Err(WipeError::Execution(format!(
                        "{} does not support sanitize",
                        node
                    )));
                }
            }
            Method::AtaSecureErase => {
                let security = Self::ata_security(&node)?;
                if !security.supported {
                    return Err(WipeError::Execution(format!(
                        "{} does not support the ATA security feature set",
                        node
                    )));
                }
                if security.frozen {
                    return Err(WipeError::Execution(format!(
                        "{} is security frozen; suspend/resume or power cycle the drive",
                        node
                    )));
                }
                if security.locked {
                    return Err(WipeError::Execution(format!("{} is security locked", node)));
                }
            }
            Method::TrimDiscard | Method::SinglePassOverwrite => {}
        }
        Ok(())
    }

    fn invoke(
        &self,
        device: &Device,
        method: Method,
        progress: &mut dyn FnMut(u8),
    ) -> WipeResult<()> {
        let node = Self::node(device);
        match method {
            Method::NvmeSanitize => self.nvme_sanitize(&node, progress),
            Method::AtaSecureErase => self.ata_secure_erase(&node, progress),
            Method::TrimDiscard => {
                progress(0);
                run_checked("blkdiscard", &["-v", &node])?;
                progress(100);
                Ok(())
            }
            Method::SinglePassOverwrite => overwrite::zero_fill(
                device.node(),
                device.capacity_bytes(),
                self.config.overwrite_chunk_bytes,
                progress,
            ),
        }
    }

    fn self_report(&self, device: &Device, method: Method) -> WipeResult<SelfReport> {
        let node = Self::node(device);
        match method {
            Method::NvmeSanitize => {
                let status = Self::sanitize_status(&node)?;
                Ok(SelfReport {
                    completed: status.state.is_success(),
                    summary: format!("sanitize log state {:?}", status.state),
                })
            }
            Method::AtaSecureErase => {
                let security = Self::ata_security(&node)?;
                Ok(SelfReport {
                    completed: !security.enabled && !security.locked,
                    summary: format!(
                        "security {}, {}",
                        if security.enabled { "enabled" } else { "not enabled" },
                        if security.locked { "locked" } else { "not locked" }
                    ),
                })
            }
            Method::TrimDiscard => Ok(SelfReport {
                completed: true,
                summary: "blkdiscard completed".to_string(),
            }),
            Method::SinglePassOverwrite => Ok(SelfReport {
                completed: true,
                summary: format!("{} bytes overwritten and synced", device.capacity_bytes()),
            }),
        }
    }

    fn attestation(&self, device: &Device, method: Method) -> WipeResult<Option<Attestation>> {
        if method != Method::NvmeSanitize || *device.transport() != Transport::NVMe {
            return Ok(None);
        }
        let status = Self::sanitize_status(&Self::node(device))?;
        Ok(Some(Attestation {
            passed: status.state.is_success(),
            detail: format!("NVMe sanitize log reports {:?}", status.state),
        }))
    }
}
