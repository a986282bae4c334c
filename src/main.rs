use std::{
    fs, io,
    path::{Path, PathBuf},
    process,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use xnode::{
    Bridge, BridgeConfig,
    bridge::SUCCESS,
    logger::init_tracing,
    platform::BackendKind,
};

#[derive(Parser, Debug)]
#[command(
    name = "xnode",
    about = "Start, stop and provision proxy worker nodes",
    version
)]
struct Cli {
    /// Keep every path under this directory instead of the system defaults
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Service backend (process, systemd, schtasks, launchd)
    #[arg(long, global = true)]
    backend: Option<BackendKind>,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a node
    Start {
        id: String,
        /// Stay in the foreground and stop the node on Ctrl-C
        #[arg(long)]
        foreground: bool,
    },

    /// Stop a node
    Stop { id: String },

    /// Print 1 (running), 0 (stopped) or -1 (unknown)
    Status { id: String },

    /// Download the worker binary unless it is installed
    Install {
        #[arg(long)]
        wait: bool,
    },

    /// Download the worker binary again
    Update {
        #[arg(long)]
        wait: bool,
    },

    /// Stop every node and remove binaries and configs
    Reset {
        /// Read a sudo credential from the first line of stdin
        #[arg(long)]
        credential_stdin: bool,
    },

    /// Write a node's config files and merge it into the node registry
    WriteConfig {
        #[arg(long)]
        worker_config: PathBuf,
        /// File holding the worker config content
        #[arg(long)]
        worker_source: PathBuf,
        #[arg(long)]
        descriptor: PathBuf,
        /// File holding the service descriptor content
        #[arg(long)]
        descriptor_source: PathBuf,
        #[arg(long)]
        registry: PathBuf,
        /// File holding a JSON array of node records
        #[arg(long)]
        entries: PathBuf,
        #[arg(long)]
        credential_stdin: bool,
    },

    /// Register a scheduled task for a node (Windows)
    CreateUnit {
        name: String,
        #[arg(long)]
        exe: String,
        #[arg(long)]
        config: String,
    },
}

fn read_credential(enabled: bool) -> anyhow::Result<Option<String>> {
    if !enabled {
        return Ok(None);
    }
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn finish(bridge: &Bridge, reply: String, wait: bool) -> String {
    if !wait || reply != xnode::bridge::DOWNLOAD_STARTED {
        return reply;
    }
    bridge.wait_for_download();
    if bridge.config().layout().binary_path().is_file() {
        SUCCESS.to_string()
    } else {
        format!("error:download failed, see {}", bridge.config().log_dir.display())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.root {
        Some(root) => BridgeConfig::rooted(root),
        None => BridgeConfig::from_env()?,
    };
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_tracing(&config.log_dir, &config.log_level, config.log_to_stdout)?;
    let bridge = Bridge::new(config)?;

    let reply = match cli.command {
        Commands::Start { id, foreground } => {
            let reply = bridge.start_node(&id);
            // a directly spawned worker dies with this process
            let hold = foreground || bridge.config().backend == BackendKind::Process;
            if reply == SUCCESS && hold {
                println!("{reply}");
                bridge.wait_for_interrupt()?;
                bridge.stop_node(&id)
            } else {
                reply
            }
        }
        Commands::Stop { id } => bridge.stop_node(&id),
        Commands::Status { id } => bridge.check_node_status(&id).to_string(),
        Commands::Install { wait } => finish(&bridge, bridge.init_worker_binary(), wait),
        Commands::Update { wait } => finish(&bridge, bridge.update_worker_binary(), wait),
        Commands::Reset { credential_stdin } => {
            let credential = read_credential(credential_stdin)?;
            bridge.reset_all(credential.as_deref())
        }
        Commands::WriteConfig {
            worker_config,
            worker_source,
            descriptor,
            descriptor_source,
            registry,
            entries,
            credential_stdin,
        } => {
            let credential = read_credential(credential_stdin)?;
            bridge.write_config_files(
                &worker_config.to_string_lossy(),
                &read_source(&worker_source)?,
                &descriptor.to_string_lossy(),
                &read_source(&descriptor_source)?,
                &registry.to_string_lossy(),
                &read_source(&entries)?,
                credential.as_deref(),
            )
        }
        Commands::CreateUnit { name, exe, config } => bridge.create_service_unit(&name, &exe, &config),
    };

    println!("{reply}");
    bridge.shutdown();
    if reply.starts_with("error:") {
        process::exit(1);
    }
    Ok(())
}
