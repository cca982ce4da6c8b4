//! Site records and domain normalisation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RegistryError;

/// Lifecycle state of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteState {
    /// Registered, external provisioning not finished yet
    Pending,
    /// Serving traffic
    Active,
    /// Released; the port is free again
    Removed,
}

impl SiteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteState::Pending => "pending",
            SiteState::Active => "active",
            SiteState::Removed => "removed",
        }
    }

    /// Pending and active sites hold their port
    pub fn is_live(&self) -> bool {
        !matches!(self, SiteState::Removed)
    }
}

impl fmt::Display for SiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SiteState::Pending),
            "active" => Ok(SiteState::Active),
            "removed" => Ok(SiteState::Removed),
            other => Err(format!("unknown site state '{}'", other)),
        }
    }
}

/// A registered domain and its backend port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub domain: String,
    pub port: u16,
    pub state: SiteState,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub removed_at: Option<DateTime<Utc>>,
}

/// Audit action recorded for every successful mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteAction {
    Registered,
    Activated,
    Released,
}

impl SiteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteAction::Registered => "registered",
            SiteAction::Activated => "activated",
            SiteAction::Released => "released",
        }
    }
}

impl fmt::Display for SiteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(SiteAction::Registered),
            "activated" => Ok(SiteAction::Activated),
            "released" => Ok(SiteAction::Released),
            other => Err(format!("unknown site action '{}'", other)),
        }
    }
}

/// Audit trail entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteEvent {
    pub id: i64,
    pub domain: String,
    pub action: SiteAction,
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

/// Normalize a domain name (lowercase, trim whitespace) and validate it
pub fn normalize_domain(domain: &str) -> Result<String, RegistryError> {
    let normalized = domain.trim().trim_end_matches('.').to_lowercase();
    let invalid = |reason: &str| RegistryError::InvalidDomain {
        domain: domain.to_string(),
        reason: reason.to_string(),
    };

    if normalized.is_empty() {
        return Err(invalid("domain cannot be empty"));
    }

    if normalized.len() > 253 {
        return Err(invalid("domain name too long"));
    }

    let valid_chars = normalized
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*');
    if !valid_chars {
        return Err(invalid("domain contains invalid characters"));
    }

    // Wildcard must be the whole first label
    if normalized.contains('*')
        && (!normalized.starts_with("*.") || normalized[1..].contains('*'))
    {
        return Err(invalid("wildcard (*) must be the first label"));
    }

    for label in normalized.split('.') {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > 63 {
            return Err(invalid("label longer than 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label cannot start or end with '-'"));
        }
    }

    Ok(normalized)
}
