//! Provisioning workflows that drive the collaborators around the registry
//!
//! Steps are not transactional as a whole. Each registry call commits on its
//! own and collaborators only run after it has returned, so a failure
//! part-way leaves the site `Pending` with the failed step named in the
//! error.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::certs::CertificateAuthority;
use crate::config::Config;
use crate::error::{RegistryError, EXIT_COLLABORATOR};
use crate::exec::CommandRunner;
use crate::proxy::{ProxyRoute, ReverseProxy};
use crate::registry::SiteRegistry;
use crate::site::{normalize_domain, Site, SiteState};
use crate::source::SourceFetcher;
use crate::supervisor::{ServiceSpec, Supervisor};

/// External step of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ProxyConfig,
    ProxyValidate,
    ProxyReload,
    ProxyScan,
    Certificate,
    SourceFetch,
    Build,
    Service,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::ProxyConfig => "proxy config",
            Step::ProxyValidate => "proxy validation",
            Step::ProxyReload => "proxy reload",
            Step::ProxyScan => "proxy scan",
            Step::Certificate => "certificate",
            Step::SourceFetch => "source fetch",
            Step::Build => "build",
            Step::Service => "service",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{step} step failed for {domain}")]
    Step {
        domain: String,
        step: Step,
        #[source]
        source: anyhow::Error,
    },
}

impl WorkflowError {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkflowError::Registry(e) => e.exit_code(),
            WorkflowError::Step { .. } => EXIT_COLLABORATOR,
        }
    }

    /// The failed external step, if any
    pub fn step(&self) -> Option<Step> {
        match self {
            WorkflowError::Registry(_) => None,
            WorkflowError::Step { step, .. } => Some(*step),
        }
    }
}

/// Result of a deploy
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub site: Site,
    pub commit: String,
    pub dir: PathBuf,
    pub built: bool,
    /// Whether the service unit was installed for the first time
    pub installed: bool,
}

/// Proxy route whose upstream port disagrees with the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMismatch {
    pub domain: String,
    pub expected: u16,
    pub found: Option<u16>,
    pub file: PathBuf,
}

/// Disagreement between active sites and the proxy configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// Active sites with no proxy route
    pub missing: Vec<Site>,
    /// Proxy routes for domains the registry does not hold
    pub unmanaged: Vec<ProxyRoute>,
    pub mismatched: Vec<PortMismatch>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unmanaged.is_empty() && self.mismatched.is_empty()
    }

    pub fn len(&self) -> usize {
        self.missing.len() + self.unmanaged.len() + self.mismatched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.is_clean()
    }
}

fn run_step<T>(
    domain: &str,
    step: Step,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, WorkflowError> {
    debug!(domain, step = %step, "Running step");
    f().map_err(|source| WorkflowError::Step {
        domain: domain.to_string(),
        step,
        source,
    })
}

/// Drives the registry and every collaborator
#[derive(Clone)]
pub struct Provisioner {
    registry: SiteRegistry,
    proxy: ReverseProxy,
    certs: CertificateAuthority,
    supervisor: Supervisor,
    source: SourceFetcher,
}

impl Provisioner {
    pub fn new(registry: SiteRegistry, config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            registry,
            proxy: ReverseProxy::new(config.proxy.clone(), runner.clone()),
            certs: CertificateAuthority::new(
                config.certs.clone(),
                config.proxy.webroot.clone(),
                runner.clone(),
            ),
            supervisor: Supervisor::new(config.supervisor.clone(), runner.clone()),
            source: SourceFetcher::new(config.source.clone(), runner),
        }
    }

    pub fn registry(&self) -> &SiteRegistry {
        &self.registry
    }

    /// Register a domain and bring it live behind the proxy, with TLS when enabled.
    ///
    /// A domain that is already `Pending` is resumed on the port it holds.
    /// With `rollback`, a failed step releases the site and removes its
    /// proxy config before the error is returned.
    pub fn provision(&self, domain: &str, rollback: bool) -> Result<Site, WorkflowError> {
        let site = match self.registry.register(domain) {
            Ok(site) => site,
            Err(RegistryError::AlreadyRegistered { domain, port }) => {
                let site = self.registry.lookup(&domain)?;
                if site.state != SiteState::Pending {
                    return Err(RegistryError::AlreadyRegistered { domain, port }.into());
                }
                info!(domain = %site.domain, port = site.port, "Resuming provisioning");
                site
            }
            Err(e) => return Err(e.into()),
        };

        match self.bring_up(&site) {
            Ok(site) => Ok(site),
            Err(err) => {
                warn!(domain = %site.domain, error = %err, rollback, "Provisioning failed");
                if rollback {
                    self.roll_back(&site.domain);
                }
                Err(err)
            }
        }
    }

    fn bring_up(&self, site: &Site) -> Result<Site, WorkflowError> {
        let domain = site.domain.as_str();

        run_step(domain, Step::ProxyConfig, || self.proxy.write_site(domain, site.port, false))?;
        self.apply_proxy(domain)?;

        if self.certs.is_enabled() {
            if self.certs.supports(domain) {
                run_step(domain, Step::Certificate, || self.certs.issue(domain))?;
                run_step(domain, Step::ProxyConfig, || self.proxy.write_site(domain, site.port, true))?;
                self.apply_proxy(domain)?;
            } else {
                warn!(domain, "Skipping certificate for wildcard domain");
            }
        }

        let site = self.registry.activate(domain)?;
        info!(domain, port = site.port, "Site provisioned");
        Ok(site)
    }

    fn apply_proxy(&self, domain: &str) -> Result<(), WorkflowError> {
        run_step(domain, Step::ProxyValidate, || self.proxy.validate())?;
        run_step(domain, Step::ProxyReload, || self.proxy.reload())
    }

    fn roll_back(&self, domain: &str) {
        match self.registry.release(domain) {
            Ok(port) => info!(domain, port, "Rolled back registration"),
            Err(e) => warn!(domain, error = %e, "Rollback could not release site"),
        }

        match self.proxy.remove_site(domain) {
            Ok(true) => {
                let restored = self.proxy.validate().and_then(|_| self.proxy.reload());
                if let Err(e) = restored {
                    warn!(domain, error = %e, "Rollback could not reload proxy");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(domain, error = %e, "Rollback could not remove proxy config"),
        }
    }

    /// Release a site and tear down its proxy route, certificate and service.
    /// Returns the freed port.
    ///
    /// Once the release has committed every teardown step runs, even after
    /// a proxy step fails, so no service is left holding the freed port.
    /// The first proxy failure is returned after the rest has run.
    pub fn deprovision(&self, domain: &str) -> Result<u16, WorkflowError> {
        let domain = normalize_domain(domain)?;
        let domain = domain.as_str();
        let port = self.registry.release(domain)?;

        let proxy_result = run_step(domain, Step::ProxyConfig, || self.proxy.remove_site(domain))
            .and_then(|_| self.apply_proxy(domain));
        if let Err(e) = &proxy_result {
            warn!(domain, error = %e, "Proxy teardown failed, continuing");
        }

        if self.certs.is_enabled() && self.certs.supports(domain) {
            if let Err(e) = self.certs.revoke(domain) {
                warn!(domain, error = %format!("{:#}", e), "Certificate removal failed");
            }
        }

        if let Err(e) = self.supervisor.uninstall(domain) {
            warn!(domain, error = %format!("{:#}", e), "Service removal failed");
        }

        proxy_result?;
        info!(domain, port, "Site deprovisioned");
        Ok(port)
    }

    /// Fetch, build and (re)start the application behind a live site
    pub fn deploy(&self, domain: &str, repo: &str, branch: &str) -> Result<Deployment, WorkflowError> {
        let site = self.registry.lookup(domain)?;
        if !site.state.is_live() {
            return Err(RegistryError::NotFound { domain: site.domain }.into());
        }
        let domain = site.domain.as_str();

        let checkout = run_step(domain, Step::SourceFetch, || self.source.fetch(domain, repo, branch))?;
        let built = run_step(domain, Step::Build, || self.source.build(&checkout))?;

        let installed = !self.supervisor.is_installed(domain);
        if installed {
            let service = ServiceSpec {
                domain: domain.to_string(),
                port: site.port,
                working_dir: checkout.dir.clone(),
                exec: self.source.start_command().to_string(),
            };
            run_step(domain, Step::Service, || self.supervisor.install(&service))?;
        } else {
            run_step(domain, Step::Service, || self.supervisor.restart(domain))?;
        }

        info!(domain, commit = %checkout.commit, installed, "Site deployed");
        Ok(Deployment {
            commit: checkout.commit,
            dir: checkout.dir,
            built,
            installed,
            site,
        })
    }

    /// Compare active sites with the routes the proxy actually has
    pub fn reconcile(&self) -> Result<DriftReport, WorkflowError> {
        let live = self.registry.list()?;
        let routes = run_step("all sites", Step::ProxyScan, || self.proxy.scan())?;

        let by_domain: HashMap<&str, &Site> =
            live.iter().map(|site| (site.domain.as_str(), site)).collect();

        let mut report = DriftReport::default();

        for site in live.iter().filter(|s| s.state == SiteState::Active) {
            if !routes.iter().any(|r| r.domain == site.domain) {
                report.missing.push(site.clone());
            }
        }

        for route in routes {
            match by_domain.get(route.domain.as_str()) {
                None => report.unmanaged.push(route),
                Some(site) if site.state == SiteState::Active && route.port != Some(site.port) => {
                    report.mismatched.push(PortMismatch {
                        domain: route.domain,
                        expected: site.port,
                        found: route.port,
                        file: route.file,
                    });
                }
                Some(_) => {}
            }
        }

        if report.is_clean() {
            info!(sites = by_domain.len(), "No drift");
        } else {
            warn!(
                missing = report.missing.len(),
                unmanaged = report.unmanaged.len(),
                mismatched = report.mismatched.len(),
                "Drift detected"
            );
        }
        Ok(report)
    }
}
