use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::registry::PortRange;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SITEPORT_CONFIG";

/// System-wide config location
pub const SYSTEM_CONFIG_PATH: &str = "/etc/siteport/siteport.toml";

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Registry storage and port range
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Admin API server
    #[serde(default)]
    pub server: ServerConfig,

    /// Reverse proxy (nginx) collaborator
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Certificate (certbot) collaborator
    #[serde(default)]
    pub certs: CertsConfig,

    /// Process supervisor (systemd) collaborator
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Source fetch (git) collaborator
    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Path to the SQLite database
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Lowest port eligible for allocation (default: 5000)
    #[serde(default = "default_port_floor")]
    pub port_floor: u16,

    /// Highest port eligible for allocation (default: 65535)
    #[serde(default = "default_port_ceiling")]
    pub port_ceiling: u16,

    /// How long a writer waits for another process holding the lock
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl RegistryConfig {
    pub fn port_range(&self) -> PortRange {
        PortRange::new(self.port_floor, self.port_ceiling)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            port_floor: default_port_floor(),
            port_ceiling: default_port_ceiling(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API (default: 9980)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Directory holding one server block per site
    #[serde(default = "default_sites_dir")]
    pub sites_dir: PathBuf,

    /// Host the proxy forwards to
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Directory served for ACME HTTP-01 challenges
    #[serde(default = "default_webroot")]
    pub webroot: PathBuf,

    /// Directory holding issued certificates, one subdirectory per domain
    #[serde(default = "default_cert_root")]
    pub cert_root: PathBuf,

    /// Command that checks the proxy configuration
    #[serde(default = "default_validate_command")]
    pub validate_command: String,

    /// Command that reloads the proxy
    #[serde(default = "default_reload_command")]
    pub reload_command: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            sites_dir: default_sites_dir(),
            upstream_host: default_upstream_host(),
            webroot: default_webroot(),
            cert_root: default_cert_root(),
            validate_command: default_validate_command(),
            reload_command: default_reload_command(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertsConfig {
    /// Request certificates during provisioning (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Contact email for the certificate authority
    pub email: Option<String>,

    /// Use the CA staging environment
    #[serde(default)]
    pub staging: bool,

    /// Command used to issue a certificate
    #[serde(default = "default_issue_command")]
    pub issue_command: String,

    /// Command used to delete a certificate
    #[serde(default = "default_revoke_command")]
    pub revoke_command: String,
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            email: None,
            staging: false,
            issue_command: default_issue_command(),
            revoke_command: default_revoke_command(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Directory for unit files
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,

    /// Prefix for unit names (default: "site-")
    #[serde(default = "default_unit_prefix")]
    pub unit_prefix: String,

    /// User the site process runs as
    #[serde(default = "default_user")]
    pub user: String,

    /// systemctl binary
    #[serde(default = "default_systemctl")]
    pub systemctl: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            unit_dir: default_unit_dir(),
            unit_prefix: default_unit_prefix(),
            user: default_user(),
            systemctl: default_systemctl(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Directory holding one checkout per site
    #[serde(default = "default_apps_dir")]
    pub apps_dir: PathBuf,

    /// git binary
    #[serde(default = "default_git")]
    pub git: String,

    /// Shell command run in the checkout after fetching (optional)
    pub build_command: Option<String>,

    /// Command the supervisor starts, relative to the checkout
    #[serde(default = "default_start_command")]
    pub start_command: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            apps_dir: default_apps_dir(),
            git: default_git(),
            build_command: None,
            start_command: default_start_command(),
        }
    }
}

// Default value functions
fn default_database() -> PathBuf {
    PathBuf::from("/var/lib/siteport/registry.db")
}

fn default_port_floor() -> u16 {
    5000
}

fn default_port_ceiling() -> u16 {
    65535
}

fn default_busy_timeout() -> u64 {
    5000 // 5 seconds
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9980
}

fn default_sites_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-enabled")
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_webroot() -> PathBuf {
    PathBuf::from("/var/www/letsencrypt")
}

fn default_cert_root() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

fn default_validate_command() -> String {
    "nginx -t".to_string()
}

fn default_reload_command() -> String {
    "systemctl reload nginx".to_string()
}

fn default_true() -> bool {
    true
}

fn default_issue_command() -> String {
    "certbot certonly --non-interactive --agree-tos --webroot".to_string()
}

fn default_revoke_command() -> String {
    "certbot delete --non-interactive".to_string()
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_unit_prefix() -> String {
    "site-".to_string()
}

fn default_user() -> String {
    "www-data".to_string()
}

fn default_systemctl() -> String {
    "systemctl".to_string()
}

fn default_apps_dir() -> PathBuf {
    PathBuf::from("/srv/sites")
}

fn default_git() -> String {
    "git".to_string()
}

fn default_start_command() -> String {
    "npm start".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Locate the config file: explicit path, then `$SITEPORT_CONFIG`, then
    /// the system path, then the per-user config directory.
    pub fn discover(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }

        let candidates = std::iter::once(PathBuf::from(SYSTEM_CONFIG_PATH))
            .chain(dirs_next::config_dir().map(|dir| dir.join("siteport").join("siteport.toml")));

        for candidate in candidates {
            debug!(path = %candidate.display(), "Looking for config file");
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        None
    }

    /// Load the discovered config, or built-in defaults when there is none
    pub fn load_or_default(explicit: Option<&Path>) -> anyhow::Result<Self> {
        match Self::discover(explicit) {
            Some(path) => Self::load(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load configuration {}: {}", path.display(), e)
            }),
            None => Ok(Self::default()),
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.registry.port_floor == 0 {
            errors.push("registry.port_floor must be greater than 0".to_string());
        }

        if self.registry.port_floor > self.registry.port_ceiling {
            errors.push(format!(
                "registry.port_floor ({}) must not exceed registry.port_ceiling ({})",
                self.registry.port_floor, self.registry.port_ceiling
            ));
        }

        if self.server.admin_port == 0 {
            errors.push("server.admin_port must be greater than 0".to_string());
        }

        let commands = [
            ("proxy.validate_command", &self.proxy.validate_command),
            ("proxy.reload_command", &self.proxy.reload_command),
            ("certs.issue_command", &self.certs.issue_command),
            ("certs.revoke_command", &self.certs.revoke_command),
            ("supervisor.systemctl", &self.supervisor.systemctl),
            ("source.git", &self.source.git),
            ("source.start_command", &self.source.start_command),
        ];

        for (name, command) in commands {
            match shell_words::split(command) {
                Ok(words) if words.is_empty() => errors.push(format!("{} is empty", name)),
                Ok(_) => {}
                Err(e) => errors.push(format!("{} cannot be parsed: {}", name, e)),
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
