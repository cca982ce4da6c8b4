//! Siteport - site registry and provisioning driver for a small web host
//!
//! This library provides:
//! - A durable registry mapping domains to backend ports, with a
//!   pending/active/removed lifecycle and race-free port allocation
//! - Drivers for the external collaborators: nginx, certbot, systemd and git
//! - Provisioning workflows that sequence those collaborators around the
//!   registry, plus drift detection against the live proxy configuration
//! - An authenticated HTTP admin API over the registry

pub mod admin;
pub mod certs;
pub mod config;
pub mod db;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod proxy;
pub mod registry;
pub mod site;
pub mod source;
pub mod supervisor;
pub mod workflow;
