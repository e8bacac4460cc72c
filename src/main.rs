use clap::{Parser, Subcommand};
use pktforge::config;
use pktforge::port::{DeviceManager, Port};
use pktforge::telemetry::init_logging;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, trace};

#[derive(Parser)]
#[command(name = "pktforge")]
#[command(about = "Per-port packet I/O engine for traffic generation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List capture devices visible to this process
    Devices,
    /// Validate a config file without running
    Validate {
        /// Path to pktforge.toml
        #[arg(short, long, default_value = "pktforge.toml")]
        config: PathBuf,
    },
    /// Run the port engine daemon
    Run {
        /// Path to pktforge.toml
        #[arg(short, long, default_value = "pktforge.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Devices => {
            init_logging(None);
            cmd_devices()
        }
        Commands::Validate { config } => {
            init_logging(None);
            cmd_validate(&config)
        }
        Commands::Run { config } => cmd_run(&config),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

/// Counts control-plane frames on behalf of the (externally provided)
/// device-emulation layer.
#[derive(Default)]
struct PacketTap {
    frames: u64,
}

impl DeviceManager for PacketTap {
    fn receive_packet(&mut self, packet: &[u8]) {
        self.frames += 1;
        trace!(len = packet.len(), total = self.frames, "emulation frame");
    }
}

fn cmd_devices() -> Result<(), String> {
    let devices = pcap::Device::list().map_err(|e| format!("Failed to list devices: {}", e))?;

    if devices.is_empty() {
        println!("No capture devices found (missing privileges?)");
        return Ok(());
    }
    for device in devices {
        let desc = device.desc.as_deref().unwrap_or("no description");
        println!("{:<24} {}", device.name, desc);
        for address in &device.addresses {
            println!("{:<24}   addr {}", "", address.addr);
        }
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<(), String> {
    println!("[INFO] Validating {}...", path.display());

    let cfg = config::load(path).map_err(|e| format!("Failed to parse config: {}", e))?;
    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}

fn cmd_run(path: &Path) -> Result<(), String> {
    let cfg = config::load(path).map_err(|e| format!("Failed to load config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err("Validation failed with errors".to_string());
    }

    init_logging(Some(&cfg.logging));

    let device_manager: Arc<Mutex<dyn DeviceManager>> =
        Arc::new(Mutex::new(PacketTap::default()));

    let mut ports = Vec::new();
    for (id, port_cfg) in cfg.ports.iter().enumerate() {
        pktforge::capture::find_device(&port_cfg.device).map_err(|e| e.to_string())?;

        info!("Binding to device {}...", port_cfg.device);
        let mut port = Port::new(
            id as u32,
            &port_cfg.device,
            Arc::clone(&device_manager),
            port_cfg.promiscuous,
        );
        if !port.is_usable() {
            return Err(format!(
                "Failed to open {}. Run with root privileges.",
                port_cfg.device
            ));
        }

        port.set_rate_accuracy(cfg.transmit.accuracy);
        port.init();

        if !port.notes().is_empty() {
            info!(port = port.id(), notes = %port.notes(), "port limitations");
        }
        if let Some(filter) = &port_cfg.capture_filter {
            port.start_capture(filter);
            info!(
                port = port.id(),
                filter = %filter,
                file = %port.capture_file().display(),
                "capture started"
            );
        }
        if port_cfg.emulation {
            port.start_device_emulation();
            info!(port = port.id(), "device emulation started");
        }

        ports.push(port);
    }

    info!("Port engine running, press Ctrl-C to stop");

    let rt = tokio::runtime::Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;
    rt.block_on(async {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut ticker = tokio::time::interval(Duration::from_secs(cfg.stats.interval_secs));

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("interrupt received, shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    for port in &ports {
                        let stats = port.stats();
                        info!(
                            port = port.id(),
                            device = %port.device(),
                            rx_pkts = stats.rx_pkts,
                            rx_bytes = stats.rx_bytes,
                            tx_pkts = stats.tx_pkts,
                            tx_bytes = stats.tx_bytes,
                            "stats"
                        );
                    }
                }
            }
        }
    });

    for port in &mut ports {
        if port.is_transmit_on() {
            port.stop_transmit();
        }
        if port.is_capture_on() {
            port.stop_capture();
            info!(
                port = port.id(),
                file = %port.capture_file().display(),
                "capture stopped"
            );
        }
        if port.is_emulation_on() {
            port.stop_device_emulation();
        }
    }

    Ok(())
}
