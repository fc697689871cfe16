//! remount - Mount a remote file service as a FUSE filesystem.
//!
//! Usage: remount [OPTIONS] <SOURCE> <MOUNTPOINT>
//!
//! ## Debugging with tokio-console
//!
//! Build with the `tokio-console` feature for async task introspection:
//! ```bash
//! cargo build -p remfs-fuse --features tokio-console
//! ```
//!
//! Then run `tokio-console` in another terminal (default: 127.0.0.1:6669).

use anyhow::{Context, Result};
use clap::Parser;
use remfs_client::{ConnectOptions, Credentials, TrustPolicy};
use remfs_fuse::{MountConfig, RemoteFs, mount};
use std::path::PathBuf;
use std::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "remount")]
#[command(about = "Mount a remote file service as a FUSE filesystem")]
#[command(version)]
struct Cli {
    /// Server URL, e.g. mem://scratch
    source: String,

    /// Local directory to mount on
    mountpoint: PathBuf,

    /// User name for the remote service
    #[arg(short, long, env = "REMFS_USER", default_value = "")]
    user: String,

    /// Password (prompted for when a user is given and no password is set)
    #[arg(short, long, env = "REMFS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Accept any server certificate
    #[arg(long)]
    trust_all: bool,

    /// Ask the client to deduplicate writes
    #[arg(long)]
    dedupe: bool,

    /// Remote directory to mount as the root
    #[arg(long, default_value = "/")]
    root: String,

    /// Mount read-only
    #[arg(long)]
    read_only: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "debug")]
    quiet: bool,
}

impl Cli {
    fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    fn password(&self) -> Result<Zeroizing<String>> {
        if let Some(ref password) = self.password {
            Ok(Zeroizing::new(password.clone()))
        } else if self.user.is_empty() {
            Ok(Zeroizing::new(String::new()))
        } else {
            let prompt = format!("Password for {}: ", self.user);
            Ok(Zeroizing::new(
                rpassword::prompt_password(prompt).context("Failed to read password")?,
            ))
        }
    }

    fn connect_options(&self, password: &str) -> ConnectOptions {
        let trust = if self.trust_all {
            TrustPolicy::TrustAll
        } else {
            TrustPolicy::Verify
        };
        ConnectOptions::new(&self.source)
            .trust_policy(trust)
            .credentials(Credentials::new(&self.user, password))
            .dedupe(self.dedupe)
    }

    fn mount_config(&self) -> MountConfig {
        MountConfig::default()
            .remote_root(&self.root)
            .read_only(self.read_only)
            .fsname(&self.source)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = cli.log_level();

    #[cfg(feature = "tokio-console")]
    {
        use std::net::SocketAddr;
        use tracing_subscriber::Layer;

        let console_port: u16 = std::env::var("TOKIO_CONSOLE_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(6669);
        let console_addr: SocketAddr = ([127, 0, 0, 1], console_port).into();
        let fmt_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

        if std::net::TcpListener::bind(console_addr).is_ok() {
            let console_layer = console_subscriber::ConsoleLayer::builder()
                .server_addr(console_addr)
                .spawn();
            tracing_subscriber::registry()
                .with(console_layer)
                .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
                .init();
            info!("tokio-console enabled, connect with: tokio-console http://127.0.0.1:{console_port}");
        } else {
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
                .init();
            warn!(
                "tokio-console port {console_port} already in use, running without console instrumentation"
            );
        }
    }

    #[cfg(not(feature = "tokio-console"))]
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    run(&cli)
}

fn run(cli: &Cli) -> Result<()> {
    if !cli.mountpoint.is_dir() {
        anyhow::bail!("Mountpoint is not a directory: {}", cli.mountpoint.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("remfs-io")
        .build()
        .context("Failed to create tokio runtime")?;

    let options = {
        let password = cli.password()?;
        cli.connect_options(&password)
    };
    info!(source = %cli.source, user = %cli.user, "Connecting");
    let client = runtime
        .block_on(remfs_client::connect(&options))
        .with_context(|| format!("Failed to connect to {}", cli.source))?;

    let fs = RemoteFs::with_runtime(client, cli.mount_config(), runtime.handle().clone())
        .context("Failed to initialize filesystem")?;

    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    let handle = mount(fs, &cli.mountpoint).context("Failed to mount filesystem")?;
    info!(
        mountpoint = %handle.mountpoint().display(),
        "Filesystem mounted (press Ctrl+C to unmount)"
    );

    match rx.recv() {
        Ok(()) => info!("Received interrupt signal, unmounting..."),
        Err(_) => warn!("Signal channel closed unexpectedly"),
    }

    handle.unmount();
    Ok(())
}
