//! BotFleet Library
//!
//! Multi-tenant control plane for long-running trading-bot processes:
//! one supervised instance per tenant behind one authenticated HTTP
//! front door.

pub mod allocator;
pub mod config;
pub mod error;
pub mod proxy;
pub mod supervisor;
pub mod types;
pub mod watchdog;
