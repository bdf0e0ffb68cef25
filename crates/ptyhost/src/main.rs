//! termmux
//!
//! Runs a local shell through the session router and attaches the current
//! terminal to it.

use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::{cursor, execute, terminal};
use protocol::{SessionSpec, SharedTransport};
use ptyhost::config::Config;
use ptyhost::logging;
use ptyhost::session::{SessionManager, Utf8Decoder};
use ptyhost::LocalTransport;
use router::{RouterLifecycleOwner, SessionEvent, SessionRouter};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Exit code reported when the session ends without one.
const LOST_SESSION_EXIT_CODE: i32 = 1;

/// How often exited sessions are swept from the manager.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// termmux - terminal sessions shared across viewers.
#[derive(Parser, Debug)]
#[command(name = "termmux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a command (default: the configured shell) and attach to it
    Run {
        /// Working directory for the session
        #[arg(long, value_name = "DIR")]
        cwd: Option<String>,

        /// Program and arguments to run
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    if cli.verbose {
        config.log.level = "debug".to_string();
    }
    config.validate()?;

    match cli.command {
        Commands::Config => {
            logging::init_stderr(&config.log.level);
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Run { cwd, command } => {
            let guard = logging::init_tracing(&config.log.level, &config.log.dir)?;
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "termmux starting");

            let result = run(config, cwd, command).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "termmux failed");
            }
            drop(guard);

            std::process::exit(result?);
        }
    }
}

/// Spawns the session, attaches this terminal to it and returns its exit code.
async fn run(config: Config, cwd: Option<String>, command: Vec<String>) -> Result<i32> {
    let (cols, rows) =
        terminal::size().unwrap_or((config.session.cols, config.session.rows));
    let mut spec = SessionSpec::default().size(cols, rows);
    if let Some((program, args)) = command.split_first() {
        spec = spec.command(program.clone(), args.to_vec());
    }
    spec.cwd = cwd;

    let shutdown = CancellationToken::new();
    let manager = Arc::new(SessionManager::new(config.session.clone()));
    let cleanup = manager.start_cleanup_task(CLEANUP_INTERVAL, shutdown.clone());
    let session_id = manager
        .create(spec)
        .context("Failed to start session")?;

    let transport: SharedTransport = Arc::new(LocalTransport::new(Arc::clone(&manager)));
    let (client_tx, client_rx) = watch::channel(Some(transport));

    let owner = RouterLifecycleOwner::new(config.router.clone());
    let mut routers = owner.watch();
    let lifecycle = tokio::spawn(owner.run(client_rx, shutdown.clone()));

    let router = routers
        .wait_for(Option::is_some)
        .await
        .map(|current| current.clone())
        .ok()
        .flatten()
        .context("Session router unavailable")?;

    let code = attach(&router, &session_id).await;

    shutdown.cancel();
    drop(client_tx);
    let _ = lifecycle.await;
    let _ = cleanup.await;
    if let Err(e) = manager.close(&session_id) {
        tracing::debug!(session_id = %session_id, error = %e, "Session already gone");
    }

    code
}

/// Mirrors the session onto this terminal until it exits.
async fn attach(router: &SessionRouter, session_id: &str) -> Result<i32> {
    let (subscription, mut events) = router.subscribe_channel(session_id);
    let _raw = RawMode::enable()?;
    spawn_input_forwarder(router.clone(), session_id.to_string());
    let mut resizes = WindowChanges::new()?;
    let mut screen = Screen::default();

    let code = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::ScreenState(state)) => screen.redraw(&state)?,
                Some(SessionEvent::Output(data)) => screen.write(&data)?,
                Some(SessionEvent::Exit(code)) => break code,
                None => break LOST_SESSION_EXIT_CODE,
            },
            Some(()) = resizes.next() => {
                if let Ok((cols, rows)) = terminal::size() {
                    if let Err(e) = router.resize(session_id, cols, rows).await {
                        tracing::warn!(session_id = %session_id, error = %e, "Resize failed");
                    }
                }
            }
        }
    };

    subscription.unsubscribe();
    tracing::info!(session_id = %session_id, exit_code = code, "Session ended");
    Ok(code)
}

/// Forwards stdin to the session from a dedicated thread.
///
/// Stdin reads cannot be cancelled, so the thread is left to die with the
/// process.
fn spawn_input_forwarder(router: SessionRouter, session_id: String) {
    let handle = tokio::runtime::Handle::current();
    std::thread::spawn(move || {
        let _runtime = handle.enter();
        let mut stdin = std::io::stdin();
        let mut decoder = Utf8Decoder::new();
        let mut buffer = [0u8; 1024];
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buffer[..n]);
                    if !text.is_empty() {
                        router.send_input(&session_id, &text);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Stdin read failed");
                    break;
                }
            }
        }
        tracing::debug!("Input forwarder stopped");
    });
}

/// Writes session output to stdout.
#[derive(Default)]
struct Screen {
    drawn: bool,
}

impl Screen {
    fn write(&mut self, data: &str) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(data.as_bytes())?;
        stdout.flush()?;
        self.drawn = true;
        Ok(())
    }

    /// Replaces what is on screen with a snapshot. The first snapshot is
    /// drawn in place.
    fn redraw(&mut self, state: &str) -> Result<()> {
        if self.drawn {
            execute!(
                std::io::stdout(),
                terminal::Clear(terminal::ClearType::All),
                cursor::MoveTo(0, 0)
            )?;
        }
        self.write(state)
    }
}

/// Raw mode for the lifetime of the guard, when stdin is a terminal.
struct RawMode {
    enabled: bool,
}

impl RawMode {
    fn enable() -> Result<Self> {
        if !std::io::stdin().is_terminal() {
            return Ok(Self { enabled: false });
        }
        terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self { enabled: true })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if self.enabled {
            let _ = terminal::disable_raw_mode();
        }
    }
}

/// Terminal window size change notifications.
#[cfg(unix)]
struct WindowChanges(tokio::signal::unix::Signal);

#[cfg(unix)]
impl WindowChanges {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        let signal = signal(SignalKind::window_change()).context("Failed to watch SIGWINCH")?;
        Ok(Self(signal))
    }

    async fn next(&mut self) -> Option<()> {
        self.0.recv().await
    }
}

#[cfg(not(unix))]
struct WindowChanges;

#[cfg(not(unix))]
impl WindowChanges {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Option<()> {
        std::future::pending().await
    }
}
