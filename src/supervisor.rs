//! Process supervisor (systemd) driver

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::exec::{CommandRunner, CommandSpec};
use crate::fsutil::{remove_if_exists, sanitize_domain, write_atomic};

/// What the supervisor should run for a site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub domain: String,
    pub port: u16,
    pub working_dir: PathBuf,
    /// Command line, resolved through `/usr/bin/env` unless absolute
    pub exec: String,
}

/// Render a systemd unit for a site
pub fn render_unit(service: &ServiceSpec, user: &str) -> String {
    let exec = if service.exec.starts_with('/') {
        service.exec.clone()
    } else {
        format!("/usr/bin/env {}", service.exec)
    };

    format!(
        r#"# Managed by siteport; changes are overwritten.
[Unit]
Description={domain} (port {port})
After=network.target

[Service]
Type=simple
User={user}
WorkingDirectory={working_dir}
ExecStart={exec}
Environment=PORT={port}
Environment=NODE_ENV=production
Restart=always
RestartSec=5

[Install]
WantedBy=multi-user.target
"#,
        domain = service.domain,
        port = service.port,
        working_dir = service.working_dir.display(),
    )
}

/// Driver for the process-supervisor collaborator
#[derive(Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
    runner: Arc<dyn CommandRunner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn unit_name(&self, domain: &str) -> String {
        format!("{}{}.service", self.config.unit_prefix, sanitize_domain(domain))
    }

    pub fn unit_path(&self, domain: &str) -> PathBuf {
        self.config.unit_dir.join(self.unit_name(domain))
    }

    fn systemctl<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::parse(&self.config.systemctl)?.args(args);
        self.runner.run_checked(&spec)?;
        Ok(())
    }

    /// Write the unit, reload systemd and (re)start the service
    pub fn install(&self, service: &ServiceSpec) -> Result<PathBuf> {
        let path = self.unit_path(&service.domain);
        let unit = self.unit_name(&service.domain);

        write_atomic(&path, &render_unit(service, &self.config.user))?;
        self.systemctl(["daemon-reload"])?;
        self.systemctl(["enable", unit.as_str()])
            .with_context(|| format!("Failed to enable {}", unit))?;
        self.systemctl(["restart", unit.as_str()])
            .with_context(|| format!("Failed to start {}", unit))?;

        info!(domain = %service.domain, port = service.port, unit = %unit, "Service installed");
        Ok(path)
    }

    pub fn restart(&self, domain: &str) -> Result<()> {
        let unit = self.unit_name(domain);
        self.systemctl(["restart", unit.as_str()])
            .with_context(|| format!("Failed to restart {}", unit))
    }

    /// Stop and disable the service and delete its unit; returns whether a unit existed
    pub fn uninstall(&self, domain: &str) -> Result<bool> {
        let path = self.unit_path(domain);
        if !path.exists() {
            return Ok(false);
        }

        let unit = self.unit_name(domain);
        if let Err(e) = self.systemctl(["disable", "--now", unit.as_str()]) {
            warn!(unit = %unit, error = %e, "Failed to stop service, removing unit anyway");
        }

        remove_if_exists(&path)?;
        self.systemctl(["daemon-reload"])?;
        info!(domain, unit = %unit, "Service removed");
        Ok(true)
    }

    pub fn is_installed(&self, domain: &str) -> bool {
        self.unit_path(domain).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;
    use std::path::Path;

    fn service(dir: &str) -> ServiceSpec {
        ServiceSpec {
            domain: "a.com".to_string(),
            port: 5000,
            working_dir: PathBuf::from(dir),
            exec: "npm start".to_string(),
        }
    }

    fn supervisor(dir: &Path, runner: Arc<RecordingRunner>) -> Supervisor {
        let config = SupervisorConfig {
            unit_dir: dir.to_path_buf(),
            ..SupervisorConfig::default()
        };
        Supervisor::new(config, runner)
    }

    #[test]
    fn test_render_unit() {
        let unit = render_unit(&service("/srv/sites/a.com"), "www-data");

        assert!(unit.contains("Description=a.com (port 5000)"));
        assert!(unit.contains("WorkingDirectory=/srv/sites/a.com"));
        assert!(unit.contains("ExecStart=/usr/bin/env npm start"));
        assert!(unit.contains("Environment=PORT=5000"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("User=www-data"));
    }

    #[test]
    fn test_render_unit_absolute_exec() {
        let mut svc = service("/srv/a");
        svc.exec = "/srv/a/bin/server --quiet".to_string();
        assert!(render_unit(&svc, "app").contains("ExecStart=/srv/a/bin/server --quiet\n"));
    }

    #[test]
    fn test_install_and_uninstall() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let sup = supervisor(tmp.path(), runner.clone());

        let path = sup.install(&service("/srv/a")).unwrap();
        assert_eq!(path, tmp.path().join("site-a.com.service"));
        assert!(sup.is_installed("a.com"));

        assert!(sup.uninstall("a.com").unwrap());
        assert!(!sup.is_installed("a.com"));
        assert!(!sup.uninstall("a.com").unwrap());

        assert_eq!(
            runner.calls(),
            vec![
                "systemctl daemon-reload",
                "systemctl enable site-a.com.service",
                "systemctl restart site-a.com.service",
                "systemctl disable --now site-a.com.service",
                "systemctl daemon-reload",
            ]
        );
    }

    #[test]
    fn test_uninstall_tolerates_stop_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new().failing("disable"));
        let sup = supervisor(tmp.path(), runner);

        std::fs::write(sup.unit_path("a.com"), "unit").unwrap();
        assert!(sup.uninstall("a.com").unwrap());
        assert!(!sup.is_installed("a.com"));
    }
}
