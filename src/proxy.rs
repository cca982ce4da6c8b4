//! Reverse proxy (nginx) driver
//!
//! Renders one server block per site into the proxy's sites directory,
//! validates and reloads the proxy, and scrapes the directory back into
//! routes for drift detection.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::exec::{CommandRunner, CommandSpec};
use crate::fsutil::{remove_if_exists, sanitize_domain, write_atomic};

static SERVER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*server_name\s+([^;]+);").expect("valid regex"));

static SERVER_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bserver\s*\{").expect("valid regex"));

static PROXY_PASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*proxy_pass\s+https?://[^:/;\s]+:(\d+)").expect("valid regex")
});

/// First line of every file this driver writes
pub const MANAGED_MARKER: &str = "# Managed by siteport";

/// Certificate files for a TLS server block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

/// A route found in the proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyRoute {
    pub domain: String,
    /// Upstream port, if the block proxies to one
    pub port: Option<u16>,
    pub file: PathBuf,
}

/// Render an nginx server block routing `domain` to `host:port`
pub fn render_server_block(
    domain: &str,
    upstream_host: &str,
    port: u16,
    webroot: &Path,
    tls: Option<&TlsFiles>,
) -> String {
    let acme_location = format!(
        r#"    location /.well-known/acme-challenge/ {{
        root {webroot};
    }}"#,
        webroot = webroot.display()
    );
    let proxy_location = proxy_location(upstream_host, port);

    let Some(tls) = tls else {
        return format!(
            r#"{marker} for {domain}; changes are overwritten.
server {{
    listen 80;
    listen [::]:80;
    server_name {domain};

{acme_location}

{proxy_location}
}}
"#,
            marker = MANAGED_MARKER,
        );
    };

    format!(
        r#"{marker} for {domain}; changes are overwritten.
server {{
    listen 80;
    listen [::]:80;
    server_name {domain};

{acme_location}

    location / {{
        return 301 https://$host$request_uri;
    }}
}}

server {{
    listen 443 ssl;
    listen [::]:443 ssl;
    http2 on;
    server_name {domain};

    ssl_certificate {certificate};
    ssl_certificate_key {private_key};
    ssl_protocols TLSv1.2 TLSv1.3;

{proxy_location}
}}
"#,
        marker = MANAGED_MARKER,
        certificate = tls.certificate.display(),
        private_key = tls.private_key.display(),
    )
}

fn proxy_location(upstream_host: &str, port: u16) -> String {
    format!(
        r#"    location / {{
        proxy_pass http://{upstream_host}:{port};
        proxy_http_version 1.1;
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_cache_bypass $http_upgrade;
    }}"#
    )
}

/// Bodies of every `server { ... }` block, comments stripped
fn server_blocks(contents: &str) -> Vec<String> {
    let stripped: String = contents
        .lines()
        .map(|line| line.split_once('#').map_or(line, |(code, _)| code))
        .collect::<Vec<_>>()
        .join("\n");

    let mut blocks = Vec::new();
    let mut from = 0;
    while let Some(open) = SERVER_BLOCK_RE.find_at(&stripped, from) {
        let body_start = open.end();
        let mut depth = 1usize;
        let mut body_end = stripped.len();
        for (i, c) in stripped[body_start..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        body_end = body_start + i;
                        break;
                    }
                }
                _ => {}
            }
        }
        blocks.push(stripped[body_start..body_end].to_string());
        from = (body_end + 1).min(stripped.len());
    }

    blocks
}

/// Extract routes from one config file's text.
///
/// Each `server_name` is paired with the `proxy_pass` of its own server
/// block. A domain served by several blocks (an HTTP redirect plus the TLS
/// block) takes the first port any of them proxies to.
pub fn parse_routes(contents: &str, file: &Path) -> Vec<ProxyRoute> {
    let mut routes: Vec<ProxyRoute> = Vec::new();

    for block in server_blocks(contents) {
        let port = PROXY_PASS_RE
            .captures(&block)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok());

        for caps in SERVER_NAME_RE.captures_iter(&block) {
            let Some(names) = caps.get(1) else { continue };
            for name in names.as_str().split_whitespace() {
                let domain = name.to_lowercase();
                if domain == "_" {
                    continue;
                }
                match routes.iter_mut().find(|r| r.domain == domain) {
                    Some(existing) => {
                        if existing.port.is_none() {
                            existing.port = port;
                        }
                    }
                    None => routes.push(ProxyRoute {
                        domain,
                        port,
                        file: file.to_path_buf(),
                    }),
                }
            }
        }
    }

    routes
}

/// Driver for the reverse proxy collaborator
#[derive(Clone)]
pub struct ReverseProxy {
    config: ProxyConfig,
    runner: Arc<dyn CommandRunner>,
}

impl ReverseProxy {
    pub fn new(config: ProxyConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// Path of the server block for a domain
    pub fn site_path(&self, domain: &str) -> PathBuf {
        self.config
            .sites_dir
            .join(format!("{}.conf", sanitize_domain(domain)))
    }

    /// Certificate files the certificate client produces for a domain
    pub fn tls_files(&self, domain: &str) -> TlsFiles {
        let dir = self.config.cert_root.join(domain);
        TlsFiles {
            certificate: dir.join("fullchain.pem"),
            private_key: dir.join("privkey.pem"),
        }
    }

    /// Webroot the proxy serves ACME challenges from
    pub fn webroot(&self) -> &Path {
        &self.config.webroot
    }

    /// Write (or overwrite) the server block for a domain
    pub fn write_site(&self, domain: &str, port: u16, tls: bool) -> Result<PathBuf> {
        let tls_files = tls.then(|| self.tls_files(domain));
        let contents = render_server_block(
            domain,
            &self.config.upstream_host,
            port,
            &self.config.webroot,
            tls_files.as_ref(),
        );

        let path = self.site_path(domain);
        write_atomic(&path, &contents)?;
        info!(domain, port, tls, path = %path.display(), "Proxy config written");
        Ok(path)
    }

    /// Delete the server block for a domain; returns whether it existed
    pub fn remove_site(&self, domain: &str) -> Result<bool> {
        let path = self.site_path(domain);
        let existed = remove_if_exists(&path)?;
        if existed {
            info!(domain, path = %path.display(), "Proxy config removed");
        } else {
            debug!(domain, path = %path.display(), "No proxy config to remove");
        }
        Ok(existed)
    }

    /// Check the proxy configuration
    pub fn validate(&self) -> Result<()> {
        let spec = CommandSpec::parse(&self.config.validate_command)?;
        self.runner
            .run_checked(&spec)
            .context("Proxy configuration is invalid")?;
        Ok(())
    }

    /// Reload the proxy
    pub fn reload(&self) -> Result<()> {
        let spec = CommandSpec::parse(&self.config.reload_command)?;
        self.runner.run_checked(&spec).context("Proxy reload failed")?;
        info!("Proxy reloaded");
        Ok(())
    }

    /// Scrape every `*.conf` in the sites directory, ordered by domain
    pub fn scan(&self) -> Result<Vec<ProxyRoute>> {
        let dir = &self.config.sites_dir;
        if !dir.exists() {
            warn!(dir = %dir.display(), "Proxy sites directory does not exist");
            return Ok(Vec::new());
        }

        let mut routes = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("conf") || !path.is_file() {
                continue;
            }

            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            routes.extend(parse_routes(&contents, &path));
        }

        routes.sort_by(|a, b| a.domain.cmp(&b.domain).then_with(|| a.file.cmp(&b.file)));
        debug!(count = routes.len(), "Scanned proxy routes");
        Ok(routes)
    }
}
