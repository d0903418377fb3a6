//! CLI conveniences around AWS Systems Manager: name-based instance
//! resolution, interactive sessions, fleet commands, port forwarding and
//! ssh over Session Manager.

pub mod aws;
pub mod command;
pub mod config;
pub mod error;
pub mod forward;
pub mod inventory;
pub mod logging;
pub mod resolve;
pub mod run;
pub mod session;
pub mod ssh;
