use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use wheelhouse::storage::LogSlice;
use wheelhouse::{
    AuthService, Catalog, CommandEngine, Config, JsonCatalog, LogEntry, LogStream, ShellLauncher,
    User, WheelhouseError,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SHORT_ID_LEN: usize = 12;

#[derive(Parser)]
#[command(name = "wheelhouse")]
#[command(about = "Run predefined commands from a catalog and follow their output")]
struct Cli {
    /// Settings file [default: ~/.wheelhouse/config.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Catalog JSON file (overrides catalog.path from the settings)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Credentials {
    /// User name from the catalog
    #[arg(long, short)]
    user: String,
    /// Password for the user
    #[arg(long, env = "WHEELHOUSE_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List the commands visible to a user
    Commands {
        #[command(flatten)]
        credentials: Credentials,
    },
    /// Execute commands by id (or unique id prefix) and follow their output
    Run {
        #[command(flatten)]
        credentials: Credentials,
        /// Command ids to execute
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Load and validate the catalog
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::new()?,
    };
    let catalog_path = cli
        .catalog
        .clone()
        .unwrap_or_else(|| config.catalog.path.clone());
    let catalog = Arc::new(
        JsonCatalog::open(&catalog_path)
            .with_context(|| format!("could not load catalog {}", catalog_path.display()))?,
    );

    match cli.command {
        Commands::Check => check(&catalog),
        Commands::Commands { credentials } => {
            let auth = AuthService::new(catalog.clone(), config.session_ttl()?);
            let (token, user) = login(&auth, &credentials).await?;
            let engine = build_engine(&config, catalog);
            let commands = engine.list_commands(&user)?;
            if commands.is_empty() {
                println!("{}", "No commands available".yellow());
            }
            for command in commands {
                print_command(&command);
            }
            auth.logout_user(&token);
            Ok(())
        }
        Commands::Run { credentials, ids } => {
            let auth = AuthService::new(catalog.clone(), config.session_ttl()?);
            let (token, user) = login(&auth, &credentials).await?;
            let engine = build_engine(&config, catalog);

            let cancel = CancellationToken::new();
            let handler_cancel = cancel.clone();
            ctrlc::set_handler(move || handler_cancel.cancel())
                .context("failed to install Ctrl-C handler")?;

            let mut started = Vec::new();
            for arg in &ids {
                let command_id = match resolve_command_id(&engine, &user, arg) {
                    Ok(id) => id,
                    Err(err) => {
                        eprintln!("{} {}: {}", "Skipping".red().bold(), arg, err);
                        continue;
                    }
                };
                match engine.execute(&user, &command_id).await {
                    Ok(exec_id) => {
                        let line = format!("[{exec_id}] started {}", short_id(&command_id));
                        println!("{}", line.green());
                        started.push(exec_id);
                    }
                    Err(err) => eprintln!("{} {}: {}", "Failed".red().bold(), arg, err),
                }
            }

            let result = follow(&engine, &user, &started, &cancel).await;
            auth.logout_user(&token);
            result
        }
    }
}

fn build_engine(config: &Config, catalog: Arc<JsonCatalog>) -> CommandEngine {
    let launcher = Arc::new(ShellLauncher::new(&config.engine.shell));
    CommandEngine::new(catalog, launcher, config.engine_settings())
}

async fn login(auth: &AuthService, credentials: &Credentials) -> Result<(String, User)> {
    let grant = auth.login_user(&credentials.user, &credentials.password).await?;
    let user = auth.get_session_user(&grant.token)?;
    Ok((grant.token, user))
}

fn check(catalog: &JsonCatalog) -> Result<()> {
    let snapshot = catalog.snapshot()?;
    println!(
        "{}",
        format!(
            "Catalog {} OK: {} commands, {} users",
            catalog.path().display(),
            snapshot.commands().len(),
            snapshot.user_count()
        )
        .green()
        .bold()
    );
    for command in snapshot.commands() {
        print_command(command);
    }
    Ok(())
}

fn print_command(command: &wheelhouse::Command) {
    let role = command
        .role
        .as_deref()
        .map(|r| format!(" [{r}]"))
        .unwrap_or_default();
    println!(
        "{}  {}{}  {}",
        short_id(&command.id).yellow(),
        command.name.bold(),
        role.cyan(),
        command.command.dimmed()
    );
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(SHORT_ID_LEN)]
}

/// Accept a full id or a prefix matching exactly one visible command.
fn resolve_command_id(engine: &CommandEngine, user: &User, arg: &str) -> Result<String> {
    let matches: Vec<_> = engine
        .list_commands(user)?
        .into_iter()
        .filter(|c| c.id.starts_with(arg))
        .collect();
    match matches.as_slice() {
        [] => Err(anyhow!(WheelhouseError::CommandNotFound)),
        [only] => Ok(only.id.clone()),
        _ => bail!("id prefix {arg} is ambiguous ({} commands)", matches.len()),
    }
}

/// Print output of `exec_ids` as it arrives until all have finished or the
/// wait is cancelled.
async fn follow(
    engine: &CommandEngine,
    user: &User,
    exec_ids: &[u64],
    cancel: &CancellationToken,
) -> Result<()> {
    let mut offsets = vec![0usize; exec_ids.len()];
    let mut finished = vec![false; exec_ids.len()];

    while finished.iter().any(|done| !done) {
        for (i, &exec_id) in exec_ids.iter().enumerate() {
            if finished[i] {
                continue;
            }
            let Some(slice) = poll_log(engine, user, exec_id, offsets[i])? else {
                finished[i] = true;
                println!("{}", format!("[{exec_id}] evicted from history").yellow());
                continue;
            };
            for entry in &slice.entries {
                print_entry(exec_id, entry);
            }
            offsets[i] += slice.entries.len();
            if let Some(code) = slice.exit_code {
                finished[i] = true;
                let line = format!("[{exec_id}] exit code {code}");
                if code == 0 {
                    println!("{}", line.green().bold());
                } else {
                    println!("{}", line.red().bold());
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
    }

    match engine.wait_executions(cancel).await {
        Ok(()) => Ok(()),
        Err(WheelhouseError::Cancelled) => {
            println!(
                "{}",
                format!("Stopped waiting, {} command(s) still running", engine.running()).yellow()
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// New log entries of `exec_id`, or `None` once later executions pushed it
/// out of the history.
fn poll_log(
    engine: &CommandEngine,
    user: &User,
    exec_id: u64,
    start: usize,
) -> Result<Option<LogSlice>> {
    match engine.get_execution_log(user, exec_id, start) {
        Ok(slice) => Ok(Some(slice)),
        Err(WheelhouseError::CommandNotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn print_entry(exec_id: u64, entry: &LogEntry) {
    let prefix = format!("[{exec_id}]").dimmed();
    match entry.stream {
        LogStream::Stdout => println!("{} {}", prefix, entry.data),
        LogStream::Stderr => println!("{} {}", prefix, entry.data.red()),
        LogStream::System => println!("{} {}", prefix, entry.data.yellow().italic()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use wheelhouse::{CatalogSnapshot, EngineSettings, MemoryCatalog};

    #[tokio::test]
    async fn evicted_execution_counts_as_finished() {
        let command = wheelhouse::Command::new("Noop", "true", None);
        let catalog = Arc::new(MemoryCatalog::new(CatalogSnapshot::new(
            vec![command.clone()],
            vec![],
        )));
        let settings = EngineSettings {
            history_capacity: 1,
            ..EngineSettings::default()
        };
        let engine = CommandEngine::new(catalog, Arc::new(ShellLauncher::default()), settings);
        let user = User {
            username: "op".to_string(),
            password_hash: String::new(),
            roles: vec![],
        };

        let first = engine.execute(&user, &command.id).await.unwrap();
        let second = engine.execute(&user, &command.id).await.unwrap();

        assert!(poll_log(&engine, &user, first, 0).unwrap().is_none());
        assert!(poll_log(&engine, &user, second, 0).unwrap().is_some());

        let cancel = CancellationToken::new();
        follow(&engine, &user, &[first, second], &cancel).await.unwrap();
        assert_eq!(engine.running(), 0);
    }
}
