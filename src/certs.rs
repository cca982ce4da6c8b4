//! Certificate authority client (certbot) driver

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::CertsConfig;
use crate::exec::{CommandRunner, CommandSpec};

/// Driver for the certificate collaborator
#[derive(Clone)]
pub struct CertificateAuthority {
    config: CertsConfig,
    webroot: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl CertificateAuthority {
    pub fn new(config: CertsConfig, webroot: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            webroot,
            runner,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether a domain can be validated over HTTP-01
    pub fn supports(&self, domain: &str) -> bool {
        !domain.starts_with("*.")
    }

    /// Command line that issues a certificate for `domain`
    pub fn issue_command(&self, domain: &str) -> Result<CommandSpec> {
        let mut spec = CommandSpec::parse(&self.config.issue_command)?
            .arg("-w")
            .arg(self.webroot.to_string_lossy())
            .arg("-d")
            .arg(domain);

        spec = match &self.config.email {
            Some(email) => spec.arg("--email").arg(email),
            None => spec.arg("--register-unsafely-without-email"),
        };

        if self.config.staging {
            spec = spec.arg("--staging");
        }

        Ok(spec)
    }

    /// Request a certificate. The proxy must already route the domain's
    /// ACME challenge path to the webroot.
    pub fn issue(&self, domain: &str) -> Result<()> {
        if !self.supports(domain) {
            anyhow::bail!("Wildcard domain {} needs DNS validation", domain);
        }

        let spec = self.issue_command(domain)?;
        info!(domain, staging = self.config.staging, "Requesting certificate");
        self.runner
            .run_checked(&spec)
            .with_context(|| format!("Certificate issuance failed for {}", domain))?;
        info!(domain, "Certificate issued");
        Ok(())
    }

    /// Delete the certificate for `domain`
    pub fn revoke(&self, domain: &str) -> Result<()> {
        let spec = CommandSpec::parse(&self.config.revoke_command)?
            .arg("--cert-name")
            .arg(domain);

        self.runner
            .run_checked(&spec)
            .with_context(|| format!("Certificate removal failed for {}", domain))?;
        info!(domain, "Certificate removed");
        Ok(())
    }
}
