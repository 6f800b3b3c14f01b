use anyhow::{bail, Context, Result};
use bitwiperz::crypto::{
    verify_certificate_in, verify_certificate_with, Certificate, FileSecretStore, KeyMaterial,
    MemorySecretStore, SignatureAlgorithm,
};
use bitwiperz::drives::{FaultPlan, SimulatedBackend, StaticInventory};
use bitwiperz::ui::{render_devices, render_plan, render_summary, ProgressView};
use bitwiperz::wipe_orchestrator::CancelHandle;
use bitwiperz::*;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bitwiperz")]
#[command(about = "Hardware-native storage sanitization with signed wipe certificates")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true, env = "BITWIPERZ_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Skip the root privilege check (DANGEROUS!)
    #[arg(long, global = true)]
    unsafe_mode: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List eligible storage devices
    List {
        /// Print the inventory as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the sanitization method chosen for every device
    Plan,

    /// Sanitize devices and issue certificates
    Wipe {
        /// Device ids as shown by `list` (e.g. sda, nvme0n1)
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        devices: Vec<String>,

        /// Wipe every eligible device
        #[arg(long)]
        all: bool,

        /// Device ids to leave out (comma-separated)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// Continue without issuing certificates
        #[arg(long)]
        no_certificate: bool,

        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Run the full workflow against simulated devices
    Simulate {
        /// Device id whose verification should find residual data
        #[arg(long)]
        fail_verification: Option<String>,

        /// Continue without issuing certificates
        #[arg(long)]
        no_certificate: bool,
    },

    /// Check a saved certificate against a trusted signing key
    VerifyCert {
        /// Certificate JSON file
        file: PathBuf,

        /// Trusted public key (hex); defaults to the key named by the
        /// certificate's keyId in the configured key directory
        #[arg(long)]
        public_key: Option<String>,
    },

    /// Generate a signing key in the configured key directory
    Keygen {
        #[arg(long, default_value = "ed25519")]
        algorithm: SignatureAlgorithm,

        #[arg(long, default_value = "default")]
        key_id: String,
    },
}

type CancelRegistry = Arc<Mutex<Vec<CancelHandle>>>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = WipeConfig::load(cli.config.as_deref())?;
    config.logging.verbose |= cli.debug;
    config.logging.json |= cli.json_logs;
    let _log_guard = logging::init(&config.logging)?;

    let touches_hardware = matches!(
        cli.command,
        Commands::List { .. } | Commands::Plan | Commands::Wipe { .. }
    );
    if touches_hardware && !cli.unsafe_mode && !is_root() {
        eprintln!("Error: This command requires root privileges.");
        eprintln!("Please run with sudo or as root user.");
        std::process::exit(1);
    }

    let registry = CancelRegistry::default();
    setup_signal_handlers(Arc::clone(&registry))?;

    match cli.command {
        Commands::List { json } => list_devices(config, json),
        Commands::Plan => show_plan(config),
        Commands::Wipe {
            devices,
            all,
            exclude,
            no_certificate,
            yes,
        } => {
            config.inventory.exclude.extend(exclude);
            if no_certificate {
                config.certificate.enabled = false;
            }
            wipe_devices(config, &devices, all, yes, &registry).await
        }
        Commands::Simulate {
            fail_verification,
            no_certificate,
        } => {
            if no_certificate {
                config.certificate.enabled = false;
            }
            simulate(config, fail_verification, &registry).await
        }
        Commands::VerifyCert { file, public_key } => {
            verify_cert(&config, &file, public_key.as_deref())
        }
        Commands::Keygen { algorithm, key_id } => keygen(&config, algorithm, &key_id),
    }
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn list_devices(config: WipeConfig, json: bool) -> Result<()> {
    let orchestrator = WipeOrchestrator::builder(config).build()?;
    let snapshot = orchestrator.enumerate()?;

    if json {
        let devices: Vec<&Device> = snapshot.devices().iter().map(|d| d.as_ref()).collect();
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else {
        print!("{}", render_devices(snapshot.devices()));
    }
    Ok(())
}

fn show_plan(config: WipeConfig) -> Result<()> {
    let orchestrator = WipeOrchestrator::builder(config).build()?;
    let snapshot = orchestrator.enumerate()?;
    if snapshot.is_empty() {
        println!("No eligible storage devices found.");
        return Ok(());
    }
    print!("{}", render_plan(&orchestrator.plan(&snapshot)));
    Ok(())
}

async fn wipe_devices(
    config: WipeConfig,
    ids: &[String],
    all: bool,
    assume_yes: bool,
    registry: &CancelRegistry,
) -> Result<()> {
    let orchestrator = WipeOrchestrator::builder(config).build()?;
    let snapshot = orchestrator.enumerate()?;

    let devices: Vec<Arc<Device>> = if all {
        snapshot.devices().to_vec()
    } else {
        ids.iter()
            .map(|id| {
                snapshot
                    .find(id)
                    .cloned()
                    .with_context(|| format!("device '{}' not found or excluded", id))
            })
            .collect::<Result<_>>()?
    };
    if devices.is_empty() {
        println!("No eligible storage devices found.");
        return Ok(());
    }

    let plan: Vec<_> = orchestrator
        .plan(&snapshot)
        .into_iter()
        .filter(|job| devices.iter().any(|d| d.id() == job.device_id))
        .collect();
    println!("\nThe following devices will be PERMANENTLY erased:\n");
    print!("{}", render_plan(&plan));
    if !orchestrator.config().certificate.enabled {
        println!("\nCertificates are disabled; no compliance record will be produced.");
    }

    if !assume_yes {
        print!("\nType 'DESTROY' to confirm: ");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if input.trim() != "DESTROY" {
            println!("Aborted.");
            return Ok(());
        }
    }

    let reports = run_jobs(&orchestrator, &devices, registry).await;
    finish(&orchestrator, &reports)
}

async fn simulate(
    config: WipeConfig,
    fail_verification: Option<String>,
    registry: &CancelRegistry,
) -> Result<()> {
    let mut backend = SimulatedBackend::new(Duration::from_millis(40));
    if let Some(device_id) = fail_verification {
        backend = backend.with_fault(
            device_id,
            FaultPlan {
                residual_after_wipe: true,
                ..Default::default()
            },
        );
    }
    let store = MemorySecretStore::generated(
        config.certificate.key_id.clone(),
        config.certificate.signature_algorithm,
    )?;

    let orchestrator = WipeOrchestrator::builder(config)
        .inventory(Arc::new(StaticInventory::demo()))
        .simulated(Arc::new(backend))
        .secret_store(Arc::new(store))
        .build()?;
    let snapshot = orchestrator.enumerate()?;

    println!("Simulated devices:\n");
    print!("{}", render_devices(snapshot.devices()));
    println!();
    print!("{}", render_plan(&orchestrator.plan(&snapshot)));
    println!();

    let reports = run_jobs(&orchestrator, snapshot.devices(), registry).await;
    finish(&orchestrator, &reports)
}

/// Submit every device and drive the progress view until all jobs report
async fn run_jobs(
    orchestrator: &WipeOrchestrator,
    devices: &[Arc<Device>],
    registry: &CancelRegistry,
) -> Vec<JobReport> {
    let events = orchestrator.subscribe();
    let expected = devices.len();
    let viewer = tokio::spawn(async move {
        let mut view = ProgressView::new();
        view.follow(events, expected).await;
    });

    let handles: Vec<JobHandle> = devices.iter().map(|d| orchestrator.submit(d)).collect();
    registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .extend(handles.iter().map(JobHandle::cancel_handle));

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        let device_id = handle.device_id().to_string();
        match handle.wait().await {
            Ok(report) => reports.push(report),
            Err(e) => tracing::error!(device = %device_id, error = %e, "Job produced no report"),
        }
    }
    registry.lock().unwrap_or_else(PoisonError::into_inner).clear();

    if tokio::time::timeout(Duration::from_secs(2), viewer).await.is_err() {
        tracing::debug!("Progress view still draining; continuing");
    }
    reports
}

/// Print the summary, save certificates, fail if any job failed
fn finish(orchestrator: &WipeOrchestrator, reports: &[JobReport]) -> Result<()> {
    println!("\n{}", "=".repeat(80));
    print!("{}", render_summary(reports));
    println!("{}", "=".repeat(80));

    let output_dir = &orchestrator.config().certificate.output_dir;
    for certificate in reports.iter().filter_map(JobReport::certificate) {
        let (json, text) = certificate.save(output_dir)?;
        println!("Certificate saved: {} ({})", json.display(), text.display());
    }

    let failed = reports.iter().filter(|r| !r.succeeded()).count();
    if failed > 0 {
        bail!("{} of {} jobs failed", failed, reports.len());
    }
    Ok(())
}

fn verify_cert(config: &WipeConfig, file: &Path, public_key: Option<&str>) -> Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("reading certificate {}", file.display()))?;
    let certificate = Certificate::from_json(&json)?;

    let (valid, trust_anchor) = match public_key {
        Some(hex_key) => {
            let trusted = hex::decode(hex_key.trim()).context("--public-key is not valid hex")?;
            (verify_certificate_with(&certificate, &trusted)?, "the given public key".to_string())
        }
        None => {
            let store = FileSecretStore::new(
                config.certificate.key_dir.clone(),
                certificate.signature_algorithm(),
            );
            let valid = verify_certificate_in(&certificate, &store).with_context(|| {
                format!(
                    "no trusted key '{}' in {}; pass --public-key",
                    certificate.key_id(),
                    config.certificate.key_dir.display()
                )
            })?;
            (valid, format!("key '{}'", certificate.key_id()))
        }
    };

    if valid {
        println!(
            "Certificate {} is VALID: {} on {} ({}, signed by {})",
            certificate.id(),
            certificate.method(),
            certificate.device_display_name(),
            certificate.signature_algorithm().as_str(),
            trust_anchor
        );
        Ok(())
    } else {
        bail!(
            "certificate {} is NOT signed by {}",
            certificate.id(),
            trust_anchor
        )
    }
}

fn keygen(config: &WipeConfig, algorithm: SignatureAlgorithm, key_id: &str) -> Result<()> {
    let store = FileSecretStore::new(config.certificate.key_dir.clone(), algorithm);
    if store.key_path(key_id).exists() {
        bail!(
            "key '{}' already exists at {}",
            key_id,
            store.key_path(key_id).display()
        );
    }

    let key = KeyMaterial::generate(algorithm)?;
    let path = store.store(key_id, &key)?;
    println!("Generated {} key '{}': {}", algorithm.as_str(), key_id, path.display());
    println!("Public key: {}", hex::encode(key.signer()?.public_key()));
    Ok(())
}

// SIGINT cancels jobs that have not reached invocation yet
fn setup_signal_handlers(registry: CancelRegistry) -> Result<()> {
    use signal_hook::{consts::SIGINT, iterator::Signals};

    let mut signals = Signals::new([SIGINT])?;

    std::thread::spawn(move || {
        for _ in signals.forever() {
            let handles = registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if handles.is_empty() {
                eprintln!("\nInterrupted.");
                std::process::exit(130);
            }

            eprintln!("\n\nInterrupt received! Cancelling jobs that have not started erasing...");
            let committed = handles.iter().filter(|h| h.cancel().is_err()).count();
            if committed > 0 {
                eprintln!(
                    "   {} job(s) already erasing cannot be aborted; waiting for them to finish.",
                    committed
                );
            }
        }
    });

    Ok(())
}
