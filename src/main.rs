use clap::{Parser, Subcommand};
use fortivpn_manager::browser::SystemBrowser;
use fortivpn_manager::config::Config;
use fortivpn_manager::credentials::{resolve_password, CredentialStore, KeyringStore, TerminalPrompt};
use fortivpn_manager::privilege::PrivilegeRunner;
use fortivpn_manager::profile::ConnectionProfile;
use fortivpn_manager::registry::{discover_untracked, ConnectionRegistry, EVENT_CAPACITY};
use fortivpn_manager::routing::{LinuxRouteTable, RouteReconciler};
use fortivpn_manager::supervisor::{
    EventKind, ProcessRegistry, SessionEvent, SupervisorContext, SysinfoScanner,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "fortivpn-manager")]
#[command(about = "Supervisor for openfortivpn tunnels with split-tunnel routing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/fortivpn-manager/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect one or more profiles and stay in the foreground until Ctrl+C
    Connect {
        /// Profile names
        #[arg(required = true)]
        names: Vec<String>,
        /// Username for password authentication
        #[arg(short, long)]
        user: Option<String>,
    },
    /// List configured profiles
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show tunnel processes running for configured profiles
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Terminate leftover tunnel processes of configured profiles
    Cleanup,
    /// Generate default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Remove a stored VPN password from the keyring
    ForgetPassword { name: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };

    match cli.command {
        Commands::Connect { names, user } => {
            let config = Config::load(&path)?;
            let profiles = names
                .iter()
                .map(|name| config.load_profile(name).cloned())
                .collect::<Result<Vec<_>, _>>()?;
            connect(&config, profiles, user).await?;
        }
        Commands::List { json } => {
            let config = Config::load_or_default(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(config.list_profiles())?);
            } else if config.list_profiles().is_empty() {
                println!("No profiles configured in {}", path.display());
            } else {
                for profile in config.list_profiles() {
                    let (host, port) = profile.host_port();
                    let auth = if profile.is_saml() { "saml" } else { "password" };
                    println!(
                        "{:<16} {}:{}  {}  routes: {}",
                        profile.name,
                        host,
                        port,
                        auth,
                        profile.route_targets.len()
                    );
                }
            }
        }
        Commands::Status { json } => {
            let config = Config::load_or_default(&path)?;
            let running =
                discover_untracked(&SysinfoScanner, &ProcessRegistry::new(), config.list_profiles());
            if json {
                let entries: Vec<serde_json::Value> = running
                    .iter()
                    .map(|(profile, process)| {
                        serde_json::json!({
                            "profile": profile,
                            "pid": process.pid,
                            "command": process.cmdline.join(" "),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if running.is_empty() {
                println!("VPN Status: Not connected");
            } else {
                println!("VPN Status: Connected");
                for (profile, process) in &running {
                    println!("  {} (pid {}): {}", profile, process.pid, process.cmdline.join(" "));
                }
            }
        }
        Commands::Cleanup => {
            let config = Config::load_or_default(&path)?;
            let registry = ConnectionRegistry::new(build_context(&config));
            registry.set_known_profiles(config.profiles.clone());
            let stopped = registry.reconcile_orphans().await;
            println!("Stopped {} leftover tunnel process(es)", stopped);
        }
        Commands::Init { force } => {
            if path.exists() && !force {
                println!("Config already exists: {} (use --force to overwrite)", path.display());
                return Ok(());
            }
            info!("Generating default config...");
            Config::example().save(&path)?;
            println!("Created default config: {}", path.display());
        }
        Commands::ForgetPassword { name } => {
            if KeyringStore.delete(&name)? {
                println!("Removed stored password for {}", name);
            } else {
                println!("No stored password for {}", name);
            }
        }
    }

    Ok(())
}

fn build_context(config: &Config) -> SupervisorContext {
    let settings = &config.settings;
    let runner = Arc::new(PrivilegeRunner::detect(
        settings.elevation,
        Arc::new(TerminalPrompt),
    ));
    let table = Arc::new(LinuxRouteTable::new(runner.clone(), settings.command_timeout()));
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    SupervisorContext {
        runner,
        routes: Arc::new(RouteReconciler::new(table, settings.routes())),
        processes: Arc::new(ProcessRegistry::new()),
        scanner: Arc::new(SysinfoScanner),
        browser: Arc::new(SystemBrowser),
        events,
        settings: settings.supervisor(),
    }
}

async fn connect(
    config: &Config,
    profiles: Vec<ConnectionProfile>,
    user: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = ConnectionRegistry::new(build_context(config));
    registry.set_known_profiles(config.profiles.clone());
    let stopped = registry.reconcile_orphans().await;
    if stopped > 0 {
        info!("Stopped {} leftover tunnel process(es)", stopped);
    }
    tokio::spawn(notify_events(registry.subscribe()));

    let store = KeyringStore;
    for mut profile in profiles {
        if let Some(user) = &user {
            profile.username = Some(user.clone());
        }
        let password = if profile.is_saml() {
            None
        } else {
            Some(resolve_password(&store, &profile.name, profile.username.as_deref())?)
        };
        registry.connect(profile, password).await?;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, disconnecting...");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if registry.active().is_empty() {
                    break;
                }
            }
        }
    }
    registry.disconnect_all().await;

    for name in config.profiles.iter().map(|p| p.name.as_str()) {
        debug!("[{}] Final state: {}", name, registry.status(name));
    }
    Ok(())
}

async fn notify_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent {
                profile,
                kind: EventKind::Connected,
            }) => notify("VPN connected", &profile),
            Ok(SessionEvent {
                profile,
                kind: EventKind::Disconnected,
            }) => notify("VPN disconnected", &profile),
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => debug!("Missed {} events", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(not(windows))]
fn notify(summary: &str, body: &str) {
    if let Err(e) = notify_rust::Notification::new()
        .summary(summary)
        .body(body)
        .show()
    {
        debug!("Desktop notification failed: {}", e);
    }
}

#[cfg(windows)]
fn notify(_summary: &str, _body: &str) {}
