//! Cooperative module runtime: lifecycle, services, config, data,
//! events, commands, logging.

pub mod bus;
pub mod command;
pub mod config;
pub mod data;
pub mod events;
pub mod logging;
pub mod module;
pub mod services;
