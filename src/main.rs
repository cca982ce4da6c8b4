//! siteport - command-line interface for the site registry
//!
//! Usage:
//!   siteport add <domain>              Register a domain on the next free port
//!   siteport remove <domain>           Release a domain and free its port
//!   siteport status <domain>           Show a site
//!   siteport list [--all]              List active (or all live) sites
//!
//!   siteport provision <domain>        Register, route and certify a site
//!   siteport deploy <domain> <repo>    Fetch, build and start the application
//!   siteport reconcile                 Compare the registry with nginx
//!
//!   siteport serve                     Run the admin API

use anyhow::{Context, Result};
use serde::Serialize;
use siteport::admin::{AdminServer, PKG_NAME, VERSION};
use siteport::config::Config;
use siteport::error::{RegistryError, EXIT_DRIFT, EXIT_INTERNAL, EXIT_USAGE};
use siteport::exec::SystemRunner;
use siteport::registry::SiteRegistry;
use siteport::site::{normalize_domain, Site, SiteEvent};
use siteport::workflow::{DriftReport, Provisioner, WorkflowError};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Branch deployed when `--branch` is not given
const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Error, PartialEq, Eq)]
enum UsageError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("'{command}' requires <{arg}>")]
    MissingArgument {
        command: &'static str,
        arg: &'static str,
    },

    #[error("unexpected argument '{arg}' for '{command}'")]
    UnexpectedArgument { command: &'static str, arg: String },

    #[error("unknown option '{flag}' for '{command}'")]
    UnknownFlag { command: &'static str, flag: String },

    #[error("option '{0}' requires a value")]
    MissingValue(String),
}

/// CLI command structure
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Add { domain: String },
    Remove { domain: String },
    Status { domain: String, json: bool },
    List { all: bool, json: bool },
    Activate { domain: String },
    History { domain: String, json: bool },
    Provision { domain: String, rollback: bool },
    Deprovision { domain: String },
    Deploy { domain: String, repo: String, branch: String },
    Reconcile { json: bool },
    Serve,
    Help,
    Version,
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config: Option<PathBuf>,
    verbose: bool,
    command: Command,
}

/// Arguments of one subcommand, split into positionals, flags and valued options
struct Args {
    command: &'static str,
    positional: Vec<String>,
    flags: Vec<&'static str>,
    values: Vec<(&'static str, String)>,
}

impl Args {
    fn parse(
        command: &'static str,
        args: &[String],
        flags: &[&'static str],
        valued: &[&'static str],
    ) -> Result<Self, UsageError> {
        let mut parsed = Args {
            command,
            positional: Vec::new(),
            flags: Vec::new(),
            values: Vec::new(),
        };

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if let Some(flag) = flags.iter().find(|f| **f == arg.as_str()) {
                parsed.flags.push(*flag);
            } else if let Some(name) = valued.iter().find(|f| **f == arg.as_str()) {
                let value = iter
                    .next()
                    .ok_or_else(|| UsageError::MissingValue(arg.clone()))?;
                parsed.values.push((*name, value.clone()));
            } else if arg.starts_with('-') && arg.len() > 1 {
                return Err(UsageError::UnknownFlag {
                    command,
                    flag: arg.clone(),
                });
            } else {
                parsed.positional.push(arg.clone());
            }
        }

        Ok(parsed)
    }

    fn has(&self, flags: &[&str]) -> bool {
        self.flags.iter().any(|f| flags.contains(f))
    }

    fn value(&self, names: &[&str]) -> Option<String> {
        self.values
            .iter()
            .rev()
            .find(|(name, _)| names.contains(name))
            .map(|(_, value)| value.clone())
    }

    /// Exactly the named positionals, in order
    fn positionals(&self, names: &[&'static str]) -> Result<Vec<String>, UsageError> {
        if let Some(extra) = self.positional.get(names.len()) {
            return Err(UsageError::UnexpectedArgument {
                command: self.command,
                arg: extra.clone(),
            });
        }

        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                self.positional.get(i).cloned().ok_or(UsageError::MissingArgument {
                    command: self.command,
                    arg: *name,
                })
            })
            .collect()
    }

    fn domain(&self) -> Result<String, UsageError> {
        Ok(self.positionals(&["domain"])?.remove(0))
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let code = match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            if e.downcast_ref::<UsageError>().is_some() {
                eprintln!("Run 'siteport help' for usage.");
            }
            exit_code_for(&e)
        }
    };

    std::process::exit(code);
}

/// Map a failure to the process exit code scripts branch on
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<UsageError>().is_some() {
        return EXIT_USAGE;
    }
    if let Some(e) = err.downcast_ref::<RegistryError>() {
        return e.exit_code();
    }
    if let Some(e) = err.downcast_ref::<WorkflowError>() {
        return e.exit_code();
    }
    EXIT_INTERNAL
}

fn run(args: &[String]) -> Result<i32> {
    let cli = parse_args(args)?;

    match cli.command {
        Command::Help => {
            print_help();
            return Ok(0);
        }
        Command::Version => {
            print_version();
            return Ok(0);
        }
        _ => {}
    }

    init_logging(cli.verbose, cli.command == Command::Serve);

    let config = Config::load_or_default(cli.config.as_deref())?;
    execute(cli.command, config)
}

fn parse_args(args: &[String]) -> Result<Cli, UsageError> {
    let mut config = None;
    let mut verbose = false;
    let mut rest = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter
                    .next()
                    .ok_or_else(|| UsageError::MissingValue(arg.clone()))?;
                config = Some(PathBuf::from(path));
            }
            "-v" | "--verbose" => verbose = true,
            other => match other.strip_prefix("--config=") {
                Some(path) => config = Some(PathBuf::from(path)),
                None => rest.push(arg.clone()),
            },
        }
    }

    Ok(Cli {
        config,
        verbose,
        command: parse_command(&rest)?,
    })
}

fn parse_command(args: &[String]) -> Result<Command, UsageError> {
    let Some((name, args)) = args.split_first() else {
        return Ok(Command::Help);
    };

    let command = match name.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "add" | "register" => Command::Add {
            domain: Args::parse("add", args, &[], &[])?.domain()?,
        },
        "remove" | "rm" | "release" => Command::Remove {
            domain: Args::parse("remove", args, &[], &[])?.domain()?,
        },
        "status" | "info" => {
            let args = Args::parse("status", args, &["--json"], &[])?;
            Command::Status {
                domain: args.domain()?,
                json: args.has(&["--json"]),
            }
        }
        "list" | "ls" => {
            let args = Args::parse("list", args, &["--all", "-a", "--json"], &[])?;
            args.positionals(&[])?;
            Command::List {
                all: args.has(&["--all", "-a"]),
                json: args.has(&["--json"]),
            }
        }
        "activate" => Command::Activate {
            domain: Args::parse("activate", args, &[], &[])?.domain()?,
        },
        "history" => {
            let args = Args::parse("history", args, &["--json"], &[])?;
            Command::History {
                domain: args.domain()?,
                json: args.has(&["--json"]),
            }
        }
        "provision" => {
            let args = Args::parse("provision", args, &["--rollback"], &[])?;
            Command::Provision {
                domain: args.domain()?,
                rollback: args.has(&["--rollback"]),
            }
        }
        "deprovision" => Command::Deprovision {
            domain: Args::parse("deprovision", args, &[], &[])?.domain()?,
        },
        "deploy" => {
            let args = Args::parse("deploy", args, &[], &["--branch", "-b"])?;
            let mut positionals = args.positionals(&["domain", "repo"])?.into_iter();
            Command::Deploy {
                domain: positionals.next().unwrap_or_default(),
                repo: positionals.next().unwrap_or_default(),
                branch: args
                    .value(&["--branch", "-b"])
                    .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            }
        }
        "reconcile" | "drift" => {
            let args = Args::parse("reconcile", args, &["--json"], &[])?;
            args.positionals(&[])?;
            Command::Reconcile {
                json: args.has(&["--json"]),
            }
        }
        "serve" => {
            Args::parse("serve", args, &[], &[])?.positionals(&[])?;
            Command::Serve
        }
        other => return Err(UsageError::UnknownCommand(other.to_string())),
    };

    Ok(command)
}

fn init_logging(verbose: bool, serving: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("siteport=debug")
    } else {
        let default = if serving { "siteport=info" } else { "siteport=warn" };
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default))
    };

    // stdout carries command output; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_registry(config: &Config) -> Result<SiteRegistry> {
    SiteRegistry::open(&config.registry).with_context(|| {
        format!(
            "Failed to open registry {}",
            config.registry.database.display()
        )
    })
}

fn provisioner(config: &Config) -> Result<Provisioner> {
    Ok(Provisioner::new(
        open_registry(config)?,
        config,
        Arc::new(SystemRunner),
    ))
}

fn execute(command: Command, config: Config) -> Result<i32> {
    match command {
        Command::Add { domain } => {
            let site = open_registry(&config)?.register(&domain)?;
            println!("{} registered on port {} ({})", site.domain, site.port, site.state);
        }
        Command::Remove { domain } => {
            let domain = normalize_domain(&domain)?;
            let port = open_registry(&config)?.release(&domain)?;
            println!("{} released, port {} is free", domain, port);
        }
        Command::Status { domain, json } => {
            let site = open_registry(&config)?.lookup(&domain)?;
            if json {
                print_json(&site)?;
            } else {
                print_site(&site);
            }
        }
        Command::List { all, json } => {
            let registry = open_registry(&config)?;
            let sites = if all { registry.list()? } else { registry.list_active()? };
            if json {
                print_json(&sites)?;
            } else {
                print_sites(&sites, all);
            }
        }
        Command::Activate { domain } => {
            let site = open_registry(&config)?.activate(&domain)?;
            println!("{} is active on port {}", site.domain, site.port);
        }
        Command::History { domain, json } => {
            let events = open_registry(&config)?.history(&domain)?;
            if json {
                print_json(&events)?;
            } else {
                print_history(&events);
            }
        }
        Command::Provision { domain, rollback } => {
            let site = provisioner(&config)?.provision(&domain, rollback)?;
            println!("{} is live on port {}", site.domain, site.port);
        }
        Command::Deprovision { domain } => {
            let domain = normalize_domain(&domain)?;
            let port = provisioner(&config)?.deprovision(&domain)?;
            println!("{} deprovisioned, port {} is free", domain, port);
        }
        Command::Deploy { domain, repo, branch } => {
            let deployment = provisioner(&config)?.deploy(&domain, &repo, &branch)?;
            println!(
                "{} deployed at {} ({}) on port {}",
                deployment.site.domain,
                short_commit(&deployment.commit),
                branch,
                deployment.site.port
            );
        }
        Command::Reconcile { json } => {
            let report = provisioner(&config)?.reconcile()?;
            if json {
                print_json(&report)?;
            } else {
                print_drift(&report);
            }
            if !report.is_clean() {
                return Ok(EXIT_DRIFT);
            }
        }
        Command::Serve => serve(config)?,
        Command::Help => print_help(),
        Command::Version => print_version(),
    }

    Ok(0)
}

fn short_commit(commit: &str) -> &str {
    commit.get(..12).unwrap_or(commit)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

fn print_site(site: &Site) {
    println!("Domain:     {}", site.domain);
    println!("Port:       {}", site.port);
    println!("State:      {}", site.state);
    println!("Created:    {}", site.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(at) = site.activated_at {
        println!("Activated:  {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(at) = site.removed_at {
        println!("Removed:    {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
}

fn print_sites(sites: &[Site], all: bool) {
    if sites.is_empty() {
        if all {
            println!("No sites registered.");
        } else {
            println!("No active sites. Use 'siteport list --all' to include pending ones.");
        }
        return;
    }

    let width = sites.iter().map(|s| s.domain.len()).max().unwrap_or(0).max(6);
    println!("{:<width$}  {:>5}  {:<8}  CREATED", "DOMAIN", "PORT", "STATE", width = width);
    for site in sites {
        println!(
            "{:<width$}  {:>5}  {:<8}  {}",
            site.domain,
            site.port,
            site.state.as_str(),
            site.created_at.format("%Y-%m-%d %H:%M"),
            width = width
        );
    }
}

fn print_history(events: &[SiteEvent]) {
    for event in events {
        println!(
            "{}  {:<10}  port {}",
            event.created_at.format("%Y-%m-%d %H:%M:%S"),
            event.action.as_str(),
            event.port
        );
    }
}

fn print_drift(report: &DriftReport) {
    if report.is_clean() {
        println!("No drift: the proxy routes every active site to its registered port.");
        return;
    }

    for site in &report.missing {
        println!("missing    {} (port {}) has no proxy route", site.domain, site.port);
    }
    for route in &report.unmanaged {
        let port = route
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "unmanaged  {} -> {} in {} is not in the registry",
            route.domain,
            port,
            route.file.display()
        );
    }
    for mismatch in &report.mismatched {
        let found = mismatch
            .found
            .map(|p| p.to_string())
            .unwrap_or_else(|| "none".to_string());
        println!(
            "mismatch   {} expects port {}, proxy has {} in {}",
            mismatch.domain,
            mismatch.expected,
            found,
            mismatch.file.display()
        );
    }
}

fn serve(config: Config) -> Result<()> {
    let registry = open_registry(&config)?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(serve_admin(config, registry))
}

async fn serve_admin(config: Config, registry: SiteRegistry) -> Result<()> {
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let _pid_file = match &config.server.pid_file {
        Some(path) => {
            let pid_file = PidFile::create(path)
                .with_context(|| format!("Failed to write PID file {}", path.display()))?;
            info!(path = %path.display(), "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ip: IpAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid admin bind address '{}'", config.server.bind))?;
    let admin_addr = SocketAddr::new(ip, config.server.admin_port);

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("Failed to bind admin API to {}", admin_addr))?;
    let admin_server = AdminServer::new(admin_addr, registry, shutdown_rx, admin_token);

    let mut admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.serve(listener).await {
            error!(error = %e, "Admin server error");
        }
    });

    let stopped_early = tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            false
        }
        _ = &mut admin_handle => true,
    };

    let _ = shutdown_tx.send(true);

    if stopped_early {
        anyhow::bail!("Admin server stopped unexpectedly");
    }

    // Wait for the server to stop (with timeout)
    if tokio::time::timeout(Duration::from_secs(5), admin_handle).await.is_err() {
        warn!("Admin server did not stop within 5s");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

/// PID file handle that maintains an exclusive lock and removes the file on drop
#[cfg(unix)]
struct PidFile {
    path: PathBuf,
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        // Open without truncating so a running instance's PID survives a failed lock
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

#[cfg(not(unix))]
struct PidFile {
    path: PathBuf,
}

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting admin server");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        token_configured = config.server.admin_token.is_some(),
        "Server configuration"
    );
    info!(
        database = %config.registry.database.display(),
        port_floor = config.registry.port_floor,
        port_ceiling = config.registry.port_ceiling,
        busy_timeout_ms = config.registry.busy_timeout_ms,
        "Registry settings"
    );
}

fn print_help() {
    println!(
        r#"
siteport - site registry and provisioning for a small web host

USAGE:
    siteport [--config <path>] [-v] <command> [options]

REGISTRY:
    add <domain>                   Register a domain on the lowest free port (pending)
    activate <domain>              Mark a pending site active
    remove <domain>                Release a site and free its port
    status <domain> [--json]       Show a site, including removed ones
    list [--all] [--json]          List active sites (--all adds pending)
    history <domain> [--json]      Show the audit trail of a domain

PROVISIONING:
    provision <domain> [--rollback]
                                   Register, write nginx config, issue a certificate
                                   and activate; --rollback releases on failure
    deprovision <domain>           Release and remove nginx config, certificate, service
    deploy <domain> <repo> [--branch <b>]
                                   Fetch, build and (re)start the application
    reconcile [--json]             Compare active sites with nginx config

SERVER:
    serve                          Run the admin API

    help                           Show this help
    version                        Show version

OPTIONS:
    -c, --config <path>            Config file (default: $SITEPORT_CONFIG,
                                   then /etc/siteport/siteport.toml)
    -v, --verbose                  Debug logging on stderr

EXIT CODES:
    0  success                     5  invalid state
    1  internal error              6  invalid domain
    2  not found                   7  collaborator step failed
    3  already registered          8  drift detected
    4  port range exhausted        64 usage error

ENVIRONMENT:
    SITEPORT_CONFIG                Config file path
    RUST_LOG                       Log filter (default: siteport=warn)
"#
    );
}

fn print_version() {
    println!("{} {}", PKG_NAME, VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    fn command(line: &str) -> Command {
        parse_args(&args(line)).unwrap().command
    }

    #[test]
    fn test_aliases() {
        let add = Command::Add {
            domain: "a.com".to_string(),
        };
        assert_eq!(command("add a.com"), add);
        assert_eq!(command("register a.com"), add);

        for line in ["remove a.com", "rm a.com", "release a.com"] {
            assert_eq!(
                command(line),
                Command::Remove {
                    domain: "a.com".to_string()
                }
            );
        }

        assert_eq!(
            command("info a.com --json"),
            Command::Status {
                domain: "a.com".to_string(),
                json: true
            }
        );
        assert_eq!(command("ls -a"), Command::List { all: true, json: false });
    }

    #[test]
    fn test_global_flags() {
        let cli = parse_args(&args("-v --config /tmp/s.toml list --json")).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/s.toml")));
        assert_eq!(cli.command, Command::List { all: false, json: true });

        let cli = parse_args(&args("status a.com --config=/etc/x.toml")).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/x.toml")));
    }

    #[test]
    fn test_deploy_and_provision() {
        assert_eq!(
            command("deploy a.com https://git.example.com/a.git"),
            Command::Deploy {
                domain: "a.com".to_string(),
                repo: "https://git.example.com/a.git".to_string(),
                branch: "main".to_string(),
            }
        );
        assert_eq!(
            command("deploy a.com repo -b prod"),
            Command::Deploy {
                domain: "a.com".to_string(),
                repo: "repo".to_string(),
                branch: "prod".to_string(),
            }
        );
        assert_eq!(
            command("provision a.com --rollback"),
            Command::Provision {
                domain: "a.com".to_string(),
                rollback: true
            }
        );
    }

    #[test]
    fn test_help_and_version() {
        assert_eq!(command(""), Command::Help);
        assert_eq!(command("--help"), Command::Help);
        assert_eq!(command("version"), Command::Version);
    }

    #[test]
    fn test_usage_errors() {
        assert_eq!(
            parse_args(&args("add")).unwrap_err(),
            UsageError::MissingArgument {
                command: "add",
                arg: "domain"
            }
        );
        assert_eq!(
            parse_args(&args("add a.com b.com")).unwrap_err(),
            UsageError::UnexpectedArgument {
                command: "add",
                arg: "b.com".to_string()
            }
        );
        assert_eq!(
            parse_args(&args("list --bogus")).unwrap_err(),
            UsageError::UnknownFlag {
                command: "list",
                flag: "--bogus".to_string()
            }
        );
        assert_eq!(
            parse_args(&args("deploy a.com repo --branch")).unwrap_err(),
            UsageError::MissingValue("--branch".to_string())
        );
        assert_eq!(
            parse_args(&args("frobnicate")).unwrap_err(),
            UsageError::UnknownCommand("frobnicate".to_string())
        );
    }

    #[test]
    fn test_exit_codes() {
        let usage = anyhow::Error::from(UsageError::UnknownCommand("x".to_string()));
        assert_eq!(exit_code_for(&usage), EXIT_USAGE);

        let not_found = anyhow::Error::from(RegistryError::NotFound {
            domain: "a.com".to_string(),
        });
        assert_eq!(exit_code_for(&not_found), 2);

        let exhausted = anyhow::Error::from(WorkflowError::Registry(RegistryError::PortExhausted {
            floor: 5000,
            ceiling: 5001,
        }));
        assert_eq!(exit_code_for(&exhausted), 4);

        let other = anyhow::anyhow!("disk on fire");
        assert_eq!(exit_code_for(&other), EXIT_INTERNAL);
    }

    #[test]
    fn test_short_commit() {
        assert_eq!(short_commit("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_commit("abc"), "abc");
    }
}
