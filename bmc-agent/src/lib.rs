//! bmc-agent - bare-metal fleet control agent
//!
//! Discovers BMCs from DHCP leases, reports their management details to the
//! inventory service and executes out-of-band commands delivered over MQTT:
//! - `leases`: lease store parsing and set operations
//! - `reconciler`: periodic single-flight enrichment and reporting
//! - `dispatcher`: command handling with resubscription
//! - `console`: TLS console proxy
//! - `oob`: BMC session abstraction and the Redfish adapter

pub mod config;
pub mod console;
pub mod dispatcher;
pub mod enrich;
pub mod event_log;
pub mod inventory;
pub mod leases;
pub mod oob;
pub mod reconciler;
pub mod transport;
pub mod uuid_cache;
