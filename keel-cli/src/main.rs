use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use keel_state::state::parse_serial;
use keel_state::{
    AcquireMode, BackendConfig, Config, KvBackend, LocalStateStore, Lock, LockStatus, LockToken,
    NamedLock, NullLock, StateStore, VersionedStateStore, create_backend, select_store,
    use_local_state, use_remote_state, with_lock,
};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Coordinated locking and state storage for infrastructure tooling", long_about = None)]
struct Cli {
    /// Key-value backend type
    #[arg(long, global = true, default_value = "dynamodb")]
    backend: String,

    /// AWS region (defaults to the AWS provider chain)
    #[arg(long, global = true)]
    region: Option<String>,

    /// DynamoDB endpoint URL, e.g. for DynamoDB Local
    #[arg(long, global = true, env = "KEEL_DYNAMODB_ENDPOINT")]
    endpoint_url: Option<String>,

    /// Table holding versioned state
    #[arg(long, global = true, env = "KEEL_STATE_TABLE", default_value = Config::DEFAULT_STATE_TABLE)]
    state_table: String,

    /// Table holding locks
    #[arg(long, global = true, env = "KEEL_LOCK_TABLE", default_value = Config::DEFAULT_LOCK_TABLE)]
    lock_table: String,

    /// Show debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and manage scope locks
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// Read and write state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Migrate to using remote state storage
    UseRemoteState {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        locking: LockOptions,
    },
    /// Migrate to using local state storage
    UseLocalState {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        locking: LockOptions,
    },
}

#[derive(Subcommand)]
enum LockCommands {
    /// Show who holds the lock
    Status {
        /// Scope of the lock
        #[arg(long)]
        scope: String,

        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Take the lock and print its token
    Acquire {
        /// Scope of the lock
        #[arg(long)]
        scope: String,

        /// Owner recorded in the lock (default: user@hostname)
        #[arg(long)]
        owner: Option<String>,
    },
    /// Forcefully take the lock from its current holder and print the new token
    Steal {
        /// Scope of the lock
        #[arg(long)]
        scope: String,

        /// Owner recorded in the lock (default: user@hostname)
        #[arg(long)]
        owner: Option<String>,
    },
    /// Release a lock held with the given token
    Release {
        /// Scope of the lock
        #[arg(long)]
        scope: String,

        /// Token printed by acquire or steal
        #[arg(long)]
        token: String,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Print the current state (local file if present, remote otherwise)
    Show {
        #[command(flatten)]
        target: Target,
    },
    /// Write the latest remote state to a file
    Pull {
        /// Scope of the state
        #[arg(long)]
        scope: String,

        /// File to write
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Store a state file as a new remote version
    Push {
        /// Scope of the state
        #[arg(long)]
        scope: String,

        /// State file to push
        #[arg(long)]
        file: PathBuf,

        #[command(flatten)]
        locking: LockOptions,
    },
}

#[derive(Args)]
struct Target {
    /// Scope of the configuration
    #[arg(long)]
    scope: String,

    /// Directory holding the local state file
    #[arg(long, default_value = ".")]
    dir: PathBuf,
}

#[derive(Args)]
struct LockOptions {
    /// Run without taking the scope lock
    #[arg(long)]
    no_lock: bool,

    /// Forcefully remove any pending lock
    #[arg(long, short)]
    force: bool,

    /// Owner recorded in the lock (default: user@hostname)
    #[arg(long)]
    owner: Option<String>,
}

impl LockOptions {
    fn mode(&self) -> AcquireMode {
        if self.force {
            AcquireMode::Steal
        } else {
            AcquireMode::Acquire
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), String> {
    let tables = Config::new()
        .with_state_table(&cli.state_table)
        .with_lock_table(&cli.lock_table);
    let backend = create_backend(&backend_config(&cli), &tables)
        .await
        .map_err(|e| e.to_string())?;
    let ctx = Context::new(backend, tables);

    match cli.command {
        Commands::Lock { command } => run_lock_command(&ctx, command).await,
        Commands::State { command } => run_state_command(&ctx, command).await,
        Commands::UseRemoteState { target, locking } => {
            run_use_remote_state(&ctx, &target, &locking).await
        }
        Commands::UseLocalState { target, locking } => {
            run_use_local_state(&ctx, &target, &locking).await
        }
    }
}

fn backend_config(cli: &Cli) -> BackendConfig {
    let mut config = BackendConfig::new(&cli.backend);
    if let Some(region) = &cli.region {
        config = config.with_attribute("region", region);
    }
    if let Some(endpoint) = &cli.endpoint_url {
        config = config.with_attribute("endpoint", endpoint);
    }
    config
}

/// Backend handle and table names shared by every command
struct Context {
    backend: Arc<dyn KvBackend>,
    tables: Config,
}

impl Context {
    fn new(backend: Arc<dyn KvBackend>, tables: Config) -> Self {
        Self { backend, tables }
    }

    fn named_lock(&self, scope: &str, owner: Option<&str>) -> NamedLock {
        let lock = NamedLock::new(self.backend.clone(), &self.tables.lock_table, scope);
        match owner {
            Some(owner) => lock.with_owner(owner),
            None => lock,
        }
    }

    fn lock(&self, scope: &str, options: &LockOptions) -> Box<dyn Lock> {
        if options.no_lock {
            Box::new(NullLock::new(scope))
        } else {
            Box::new(self.named_lock(scope, options.owner.as_deref()))
        }
    }

    fn remote(&self, scope: &str) -> VersionedStateStore {
        VersionedStateStore::new(self.backend.clone(), &self.tables.state_table, scope)
    }
}

async fn run_lock_command(ctx: &Context, command: LockCommands) -> Result<(), String> {
    match command {
        LockCommands::Status { scope, json } => run_lock_status(ctx, &scope, json).await,
        LockCommands::Acquire { scope, owner } => {
            let token = ctx
                .named_lock(&scope, owner.as_deref())
                .acquire()
                .await
                .map_err(|e| e.to_string())?;
            println!("{}", token);
            Ok(())
        }
        LockCommands::Steal { scope, owner } => {
            let token = ctx
                .named_lock(&scope, owner.as_deref())
                .steal()
                .await
                .map_err(|e| e.to_string())?;
            eprintln!("{} {}", "Stole lock for".yellow().bold(), scope);
            println!("{}", token);
            Ok(())
        }
        LockCommands::Release { scope, token } => {
            ctx.named_lock(&scope, None)
                .release(&LockToken::new(token))
                .await
                .map_err(|e| e.to_string())?;
            println!("{} {}", "Released lock for".green(), scope);
            Ok(())
        }
    }
}

async fn run_lock_status(ctx: &Context, scope: &str, json: bool) -> Result<(), String> {
    let status = ctx
        .named_lock(scope, None)
        .status()
        .await
        .map_err(|e| e.to_string())?;

    if json {
        let output = serde_json::to_string_pretty(&status)
            .map_err(|e| format!("Failed to serialize lock status: {}", e))?;
        println!("{}", output);
        return Ok(());
    }

    match &status {
        LockStatus::Locked(holder) => println!(
            "{}: {} by {} since {}",
            scope.bold(),
            "locked".yellow().bold(),
            holder.owner,
            holder.locked_at
        ),
        LockStatus::Unlocked => println!("{}: {}", scope.bold(), "unlocked".green()),
    }
    Ok(())
}

async fn run_state_command(ctx: &Context, command: StateCommands) -> Result<(), String> {
    match command {
        StateCommands::Show { target } => run_state_show(ctx, &target).await,
        StateCommands::Pull { scope, output } => run_state_pull(ctx, &scope, &output).await,
        StateCommands::Push {
            scope,
            file,
            locking,
        } => run_state_push(ctx, &scope, &file, &locking).await,
    }
}

async fn run_state_show(ctx: &Context, target: &Target) -> Result<(), String> {
    let store = select_store(LocalStateStore::new(&target.dir), ctx.remote(&target.scope));
    let location = if store.is_local() { "local" } else { "remote" };

    match store.get().await.map_err(|e| e.to_string())? {
        Some(state) => println!("{}", String::from_utf8_lossy(&state)),
        None => eprintln!("No {} state for {}", location, target.scope),
    }
    Ok(())
}

async fn run_state_pull(ctx: &Context, scope: &str, output: &Path) -> Result<(), String> {
    let state = ctx
        .remote(scope)
        .get()
        .await
        .map_err(|e| e.to_string())?;

    let Some(state) = state else {
        eprintln!("No remote state for {}", scope);
        return Ok(());
    };

    fs::write(output, &state)
        .map_err(|e| format!("Failed to write {}: {}", output.display(), e))?;
    println!(
        "{} {} to {}",
        "Pulled".green(),
        describe_serial(&state),
        output.display()
    );
    Ok(())
}

async fn run_state_push(
    ctx: &Context,
    scope: &str,
    file: &Path,
    locking: &LockOptions,
) -> Result<(), String> {
    let state =
        fs::read(file).map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
    let lock = ctx.lock(scope, locking);
    let remote = ctx.remote(scope);

    with_lock(&*lock, locking.mode(), || remote.put(&state))
        .await
        .map_err(|e| e.to_string())?;

    println!("{} {} for {}", "Pushed".green(), describe_serial(&state), scope);
    Ok(())
}

async fn run_use_remote_state(
    ctx: &Context,
    target: &Target,
    locking: &LockOptions,
) -> Result<(), String> {
    let lock = ctx.lock(&target.scope, locking);
    let local = LocalStateStore::new(&target.dir);
    let remote = ctx.remote(&target.scope);

    let moved = with_lock(&*lock, locking.mode(), || {
        use_remote_state(&local, &remote)
    })
    .await
    .map_err(|e| e.to_string())?;

    if moved {
        println!("{} {}", "Now using remote state for".green(), target.scope);
    } else {
        println!("No local state for {}, nothing to migrate", target.scope);
    }
    Ok(())
}

async fn run_use_local_state(
    ctx: &Context,
    target: &Target,
    locking: &LockOptions,
) -> Result<(), String> {
    let lock = ctx.lock(&target.scope, locking);
    let local = LocalStateStore::new(&target.dir);
    let remote = ctx.remote(&target.scope);

    let copied = with_lock(&*lock, locking.mode(), || {
        use_local_state(&local, &remote)
    })
    .await
    .map_err(|e| e.to_string())?;

    if copied {
        println!(
            "{} {}",
            "Now using local state at".green(),
            local.state_path().display()
        );
    } else {
        println!("No remote state for {}, nothing to migrate", target.scope);
    }
    Ok(())
}

fn describe_serial(state: &[u8]) -> String {
    match parse_serial(state) {
        Ok(serial) => format!("serial {}", serial),
        Err(_) => "state".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn memory_context() -> Context {
        let tables = Config::default();
        let backend = create_backend(&BackendConfig::new("memory"), &tables)
            .await
            .unwrap();
        Context::new(backend, tables)
    }

    fn lock_options(no_lock: bool, force: bool) -> LockOptions {
        LockOptions {
            no_lock,
            force,
            owner: Some("tester".to_string()),
        }
    }

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::try_parse_from(["keel", "lock", "status", "--scope", "infra/prod.rb"])
            .unwrap();
        assert_eq!(cli.backend, "dynamodb");
        assert!(!cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Lock {
                command: LockCommands::Status { json: false, .. }
            }
        ));
    }

    #[test]
    fn test_parse_table_overrides() {
        let cli = Cli::try_parse_from([
            "keel",
            "--state-table",
            "team-state",
            "--lock-table",
            "team-locks",
            "--endpoint-url",
            "http://localhost:8000",
            "use-remote-state",
            "--scope",
            "infra/prod.rb",
            "--force",
        ])
        .unwrap();

        assert_eq!(cli.state_table, "team-state");
        assert_eq!(cli.lock_table, "team-locks");
        let config = backend_config(&cli);
        assert_eq!(config.get_string("endpoint"), Some("http://localhost:8000"));
        match cli.command {
            Commands::UseRemoteState { target, locking } => {
                assert_eq!(target.dir, PathBuf::from("."));
                assert_eq!(locking.mode(), AcquireMode::Steal);
            }
            _ => panic!("Expected use-remote-state"),
        }
    }

    #[test]
    fn test_parse_release_requires_token() {
        let result = Cli::try_parse_from(["keel", "lock", "release", "--scope", "s"]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_push_releases_lock() {
        let ctx = memory_context().await;
        let dir = tempdir().unwrap();
        let file = dir.path().join("state.json");
        fs::write(&file, br#"{"serial": 3}"#).unwrap();

        run_state_push(&ctx, "infra/prod.rb", &file, &lock_options(false, false))
            .await
            .unwrap();

        let status = ctx.named_lock("infra/prod.rb", None).status().await.unwrap();
        assert_eq!(status, LockStatus::Unlocked);
        assert_eq!(
            ctx.remote("infra/prod.rb").get().await.unwrap(),
            Some(br#"{"serial": 3}"#.to_vec())
        );
    }

    #[tokio::test]
    async fn test_push_fails_when_locked() {
        let ctx = memory_context().await;
        let dir = tempdir().unwrap();
        let file = dir.path().join("state.json");
        fs::write(&file, br#"{"serial": 3}"#).unwrap();
        ctx.named_lock("infra/prod.rb", Some("someone-else"))
            .acquire()
            .await
            .unwrap();

        let err = run_state_push(&ctx, "infra/prod.rb", &file, &lock_options(false, false))
            .await
            .unwrap_err();
        assert!(err.contains("someone-else"));
        assert!(ctx.remote("infra/prod.rb").get().await.unwrap().is_none());

        // --no-lock bypasses the lock entirely
        run_state_push(&ctx, "infra/prod.rb", &file, &lock_options(true, false))
            .await
            .unwrap();
        assert!(ctx.remote("infra/prod.rb").get().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_push_conflict_leaves_lock_held() {
        let ctx = memory_context().await;
        let dir = tempdir().unwrap();
        let file = dir.path().join("state.json");
        ctx.remote("infra/prod.rb")
            .put(br#"{"serial": 3, "a": 1}"#)
            .await
            .unwrap();
        fs::write(&file, br#"{"serial": 3, "a": 2}"#).unwrap();

        let err = run_state_push(&ctx, "infra/prod.rb", &file, &lock_options(false, false))
            .await
            .unwrap_err();
        assert!(err.contains("serial 3"));

        let status = ctx.named_lock("infra/prod.rb", None).status().await.unwrap();
        assert_eq!(status.holder().unwrap().owner, "tester");
    }

    #[tokio::test]
    async fn test_migrate_round_trip() {
        let ctx = memory_context().await;
        let dir = tempdir().unwrap();
        let target = Target {
            scope: "infra/prod.rb".to_string(),
            dir: dir.path().to_path_buf(),
        };
        let local = LocalStateStore::new(dir.path());
        local.put(br#"{"serial": 8}"#).await.unwrap();

        run_use_remote_state(&ctx, &target, &lock_options(false, false))
            .await
            .unwrap();
        assert!(!local.exists());

        run_use_local_state(&ctx, &target, &lock_options(false, false))
            .await
            .unwrap();
        assert_eq!(local.get().await.unwrap(), Some(br#"{"serial": 8}"#.to_vec()));

        let status = ctx.named_lock("infra/prod.rb", None).status().await.unwrap();
        assert_eq!(status, LockStatus::Unlocked);
    }

    #[tokio::test]
    async fn test_pull_writes_latest_state() {
        let ctx = memory_context().await;
        let dir = tempdir().unwrap();
        let output = dir.path().join("pulled.tfstate");
        ctx.remote("infra/prod.rb")
            .put(br#"{"serial": 5}"#)
            .await
            .unwrap();

        run_state_pull(&ctx, "infra/prod.rb", &output).await.unwrap();
        assert_eq!(fs::read(&output).unwrap(), br#"{"serial": 5}"#.to_vec());
    }

    #[test]
    fn test_describe_serial() {
        assert_eq!(describe_serial(br#"{"serial": 12}"#), "serial 12");
        assert_eq!(describe_serial(b"garbage"), "state");
    }
}
