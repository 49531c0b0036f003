//! changeguard operator: wiring for controllers, webhooks and servers

#![deny(missing_docs)]

/// Controller and reflector futures
pub mod controller_runner;
/// HTTPS webhook server, HTTP callback and health server
pub mod server;
/// Startup installs (CRDs, webhook configurations)
pub mod startup;
