use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mcman_core::config::GlobalConfig;
use mcman_core::host::HostCapabilities;
use mcman_core::instance::{self, NewServer};
use mcman_core::ipc::IPCServer;
use mcman_core::supervisor::console::VISIBLE_LINES;
use mcman_core::supervisor::{ConsoleLine, LineSource, SupervisorError, SupervisorRegistry};

#[derive(Parser)]
#[command(name = "mcman-core", version, about = "Minecraft server supervisor")]
struct Cli {
    /// Path to global.toml (default: $MCMAN_CONFIG or config/global.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the servers directory from the config
    #[arg(long, global = true)]
    servers_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP control API (default)
    Daemon {
        /// Bind address, overrides ipc_listen
        #[arg(long)]
        listen: Option<String>,
    },
    /// Start one server in the foreground; stdin lines become console commands
    Run { name: String },
    /// List instances
    List,
    /// Create an instance from an already downloaded server jar
    Create {
        name: String,
        #[arg(long)]
        jar: PathBuf,
        #[arg(long = "type", default_value = "paper")]
        server_type: String,
        #[arg(long)]
        version: String,
        #[arg(long, default_value_t = instance::DEFAULT_MEMORY_MB)]
        memory: u64,
        #[arg(long, default_value_t = instance::DEFAULT_PORT)]
        port: u16,
        #[arg(long, default_value_t = 20)]
        max_players: u32,
    },
    /// Copy an existing server directory into the servers directory
    Import { source: PathBuf, name: String },
    /// Manage backups of one instance
    Backup {
        name: String,
        #[command(subcommand)]
        action: BackupCmd,
    },
    /// Manage plugins of one instance
    Plugin {
        name: String,
        #[command(subcommand)]
        action: PluginCmd,
    },
}

#[derive(Subcommand)]
enum BackupCmd {
    Create { backup: Option<String> },
    List,
    Restore { backup: String },
    Delete { backup: String },
    /// Keep the newest N archives (negative keeps all)
    Prune {
        #[arg(allow_hyphen_values = true)]
        keep: i64,
    },
}

#[derive(Subcommand)]
enum PluginCmd {
    List,
    /// Copy a plugin jar into plugins/
    Install { jar: PathBuf },
    Delete { plugin: String },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => GlobalConfig::load_from(path)?,
        None => GlobalConfig::load()?,
    };
    if let Some(dir) = cli.servers_dir {
        cfg.servers_dir = dir;
    }
    init_logging(&cfg.log_level);

    let host = HostCapabilities::detect(cfg.java_path.as_deref());
    let registry = Arc::new(SupervisorRegistry::new(&cfg.servers_dir, host));

    match cli.command.unwrap_or(Commands::Daemon { listen: None }) {
        Commands::Daemon { listen } => {
            let listen = listen.unwrap_or_else(|| cfg.ipc_listen.clone());
            run_daemon(registry, &listen).await
        }
        Commands::Run { name } => run_headless(registry, &name).await,
        Commands::List => {
            for name in registry.list()? {
                let sup = registry.get(&name).await?;
                println!(
                    "{:<24} port {:<6} memory {} MB",
                    name,
                    sup.instance().port(),
                    sup.max_ram_mb()
                );
            }
            Ok(())
        }
        Commands::Create {
            name,
            jar,
            server_type,
            version,
            memory,
            port,
            max_players,
        } => {
            let mut new = NewServer::new(&name, &server_type, &version, jar);
            new.memory_mb = memory;
            new.port = port;
            new.max_players = max_players;
            let sup = registry.create(&new).await?;
            println!("Created '{}' in {}", sup.name(), sup.instance().base_dir().display());
            Ok(())
        }
        Commands::Import { source, name } => {
            let sup = registry.import(&source, &name).await?;
            println!("Imported '{}' into {}", sup.name(), sup.instance().base_dir().display());
            Ok(())
        }
        Commands::Backup { name, action } => run_backup(&registry, &name, action).await,
        Commands::Plugin { name, action } => {
            let sup = registry.get(&name).await?;
            match action {
                PluginCmd::List => {
                    for p in sup.list_plugins()? {
                        println!("{:<32} {}", p.name, p.version);
                    }
                }
                PluginCmd::Install { jar } => {
                    let info = sup.install_plugin(&jar)?;
                    println!("Installed {} -> {}", info.name, info.path.display());
                }
                PluginCmd::Delete { plugin } => {
                    sup.delete_plugin(&plugin)?;
                    println!("Deleted {}", plugin);
                }
            }
            Ok(())
        }
    }
}

async fn run_daemon(registry: Arc<SupervisorRegistry>, listen: &str) -> Result<()> {
    tracing::info!("mcman daemon starting (servers: {})", registry.servers_dir().display());
    let shutdown = CancellationToken::new();

    match registry.start_schedulers(shutdown.clone()).await {
        Ok(n) => tracing::info!("Backup schedulers running for {} instance(s)", n),
        Err(e) => tracing::warn!("Could not start backup schedulers: {}", e),
    }

    let ipc_server = IPCServer::new(registry.clone(), listen);
    let mut server = tokio::spawn(ipc_server.start_with_shutdown(shutdown.clone()));

    // Ctrl+C 또는 IPC 서버 종료 시 모든 서버 정지
    let served = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping servers...");
            None
        }
        res = &mut server => Some(res),
    };

    for (name, outcome) in registry.stop_all().await {
        tracing::info!("[{}] {:?}", name, outcome);
    }
    shutdown.cancel();

    let served = match served {
        Some(res) => res,
        None => server.await,
    };
    served.context("IPC server task panicked")??;
    tracing::info!("mcman daemon shut down");
    Ok(())
}

fn print_line(line: &ConsoleLine) {
    match line.source {
        LineSource::Stdout => println!("{}", line.content),
        LineSource::Stderr => eprintln!("{}", line.content),
        LineSource::System => println!("[mcman] {}", line.content),
    }
}

/// Foreground mode: console to stdout, stdin to the server, Ctrl+C stops it.
async fn run_headless(registry: Arc<SupervisorRegistry>, name: &str) -> Result<()> {
    let sup = registry.get(name).await?;
    let mut lines = sup.console().subscribe();
    let mut running = sup.subscribe_running();
    registry.start(name).await?;

    let mut last_id = 0;
    for line in sup.console().recent(VISIBLE_LINES) {
        last_id = line.id;
        print_line(&line);
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            recv = lines.recv() => match recv {
                Ok(line) if line.id > last_id => {
                    last_id = line.id;
                    print_line(&line);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::warn!("Console output skipped {} lines", n),
                Err(RecvError::Closed) => break,
            },
            input = stdin.next_line(), if stdin_open => match input {
                Ok(Some(cmd)) if !cmd.trim().is_empty() => {
                    if !sup.send_command(cmd.trim()).await {
                        eprintln!("[mcman] command not delivered");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!("stdin closed: {}", e);
                    stdin_open = false;
                }
            },
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                println!("[mcman] stopping {}...", name);
                let outcome = sup.stop().await;
                if !outcome.is_success() {
                    eprintln!("[mcman] server did not stop cleanly ({:?})", outcome);
                }
                break;
            }
        }
    }

    // 종료 직전 출력 비우기
    while let Ok(line) = lines.try_recv() {
        if line.id > last_id {
            last_id = line.id;
            print_line(&line);
        }
    }
    Ok(())
}

async fn run_backup(registry: &SupervisorRegistry, name: &str, action: BackupCmd) -> Result<()> {
    let sup = registry.get(name).await?;
    let backups = sup.backups();
    match action {
        BackupCmd::Create { backup } => {
            let info = backups.create(backup.as_deref()).await?;
            println!("Created {} ({} bytes)", info.name, info.size);
        }
        BackupCmd::List => {
            for b in backups.list()? {
                let when = chrono::DateTime::from_timestamp(b.created_at as i64, 0)
                    .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("{:<32} {:>12} {}", b.name, b.size, when);
            }
        }
        BackupCmd::Restore { backup } => {
            // 이 프로세스 밖(데몬)에서 실행 중일 수 있으므로 포트로 한 번 더 확인
            if instance::port_in_use(sup.instance().port()) {
                return Err(SupervisorError::ServerRunning(name.to_string()).into());
            }
            backups.restore(&backup).await?;
            println!("Restored {}", backup);
        }
        BackupCmd::Delete { backup } => {
            backups.delete(&backup).await?;
            println!("Deleted {}", backup);
        }
        BackupCmd::Prune { keep } => {
            for removed in backups.prune(keep).await? {
                println!("Deleted {}", removed);
            }
        }
    }
    Ok(())
}
