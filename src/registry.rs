//! Site registry: domain to port mapping with a pending/active/removed lifecycle
//!
//! The registry is the sole owner of port allocation. It never calls out to
//! the reverse proxy, certificate client or process supervisor; callers run
//! those steps after a registry operation has returned.

use chrono::Utc;
use tracing::{debug, info};

use crate::config::RegistryConfig;
use crate::db::{self, Database};
use crate::error::RegistryError;
use crate::site::{normalize_domain, Site, SiteAction, SiteEvent, SiteState};

/// Inclusive range of ports eligible for allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub floor: u16,
    pub ceiling: u16,
}

impl PortRange {
    pub fn new(floor: u16, ceiling: u16) -> Self {
        Self { floor, ceiling }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.floor..=self.ceiling).contains(&port)
    }

    /// Lowest port in range not present in `held` (ascending)
    pub fn first_free(&self, held: &[u16]) -> Option<u16> {
        let mut candidate = u32::from(self.floor);

        for &port in held {
            let port = u32::from(port);
            if port < candidate {
                continue;
            }
            if port > candidate {
                break;
            }
            candidate += 1;
        }

        if candidate <= u32::from(self.ceiling) {
            Some(candidate as u16)
        } else {
            None
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(5000, 65535)
    }
}

/// Durable, race-free registry of sites
#[derive(Clone)]
pub struct SiteRegistry {
    db: Database,
    ports: PortRange,
}

impl SiteRegistry {
    pub fn new(db: Database, ports: PortRange) -> Self {
        Self { db, ports }
    }

    /// Open the registry database described by the config
    pub fn open(config: &RegistryConfig) -> anyhow::Result<Self> {
        let db = Database::open(&config.database, config.busy_timeout())?;
        Ok(Self::new(db, config.port_range()))
    }

    pub fn port_range(&self) -> PortRange {
        self.ports
    }

    /// Register a new domain on the lowest free port, in state pending
    pub fn register(&self, domain: &str) -> Result<Site, RegistryError> {
        let domain = normalize_domain(domain)?;
        let ports = self.ports;
        let now = Utc::now();

        let site = self.db.write(|tx| -> Result<Site, RegistryError> {
            if let Some(existing) = db::live_site(tx, &domain)? {
                return Err(RegistryError::AlreadyRegistered {
                    domain: existing.domain,
                    port: existing.port,
                });
            }

            let held = db::held_ports(tx, ports.floor, ports.ceiling)?;
            let port = ports.first_free(&held).ok_or(RegistryError::PortExhausted {
                floor: ports.floor,
                ceiling: ports.ceiling,
            })?;

            db::insert_site(tx, &domain, port, now)?;
            db::insert_event(tx, &domain, SiteAction::Registered, port, now)?;

            Ok(Site {
                domain: domain.clone(),
                port,
                state: SiteState::Pending,
                created_at: now,
                activated_at: None,
                removed_at: None,
            })
        })?;

        info!(domain = %site.domain, port = site.port, "Site registered");
        Ok(site)
    }

    /// Move a pending site to active
    pub fn activate(&self, domain: &str) -> Result<Site, RegistryError> {
        let domain = normalize_domain(domain)?;
        let now = Utc::now();

        let site = self.db.write(|tx| -> Result<Site, RegistryError> {
            let site = match db::latest_site(tx, &domain)? {
                Some(site) => site,
                None => return Err(RegistryError::NotFound { domain: domain.clone() }),
            };

            if site.state != SiteState::Pending {
                return Err(RegistryError::InvalidState {
                    domain: site.domain,
                    state: site.state,
                });
            }

            db::mark_active(tx, &domain, now)?;
            db::insert_event(tx, &domain, SiteAction::Activated, site.port, now)?;

            Ok(Site {
                state: SiteState::Active,
                activated_at: Some(now),
                ..site
            })
        })?;

        info!(domain = %site.domain, port = site.port, "Site activated");
        Ok(site)
    }

    /// Remove a live site and return its freed port
    pub fn release(&self, domain: &str) -> Result<u16, RegistryError> {
        let domain = normalize_domain(domain)?;
        let now = Utc::now();

        let port = self.db.write(|tx| -> Result<u16, RegistryError> {
            let site = db::live_site(tx, &domain)?
                .ok_or_else(|| RegistryError::NotFound { domain: domain.clone() })?;

            db::mark_removed(tx, &domain, now)?;
            db::insert_event(tx, &domain, SiteAction::Released, site.port, now)?;

            Ok(site.port)
        })?;

        info!(domain = %domain, port, "Site released");
        Ok(port)
    }

    /// Current site for a domain; a removed domain reports its last row
    pub fn lookup(&self, domain: &str) -> Result<Site, RegistryError> {
        let domain = normalize_domain(domain)?;

        self.db
            .read(|conn| db::latest_site(conn, &domain))?
            .ok_or(RegistryError::NotFound { domain })
    }

    /// Active sites ordered by domain
    pub fn list_active(&self) -> Result<Vec<Site>, RegistryError> {
        let sites = self.db.read(|conn| db::sites_in_states(conn, &[SiteState::Active]))?;
        debug!(count = sites.len(), "Listed active sites");
        Ok(sites)
    }

    /// Pending and active sites ordered by domain
    pub fn list(&self) -> Result<Vec<Site>, RegistryError> {
        let sites = self
            .db
            .read(|conn| db::sites_in_states(conn, &[SiteState::Pending, SiteState::Active]))?;
        Ok(sites)
    }

    /// Audit trail for a domain, oldest first
    pub fn history(&self, domain: &str) -> Result<Vec<SiteEvent>, RegistryError> {
        let domain = normalize_domain(domain)?;
        let events = self.db.read(|conn| db::events_for(conn, &domain))?;

        if events.is_empty() {
            return Err(RegistryError::NotFound { domain });
        }
        Ok(events)
    }
}
