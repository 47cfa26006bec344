pub mod adapters;
pub mod api;
pub mod aws_cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod idle;
pub mod maintenance;
pub mod mc_query;
pub mod notify;
pub mod rcon;
pub mod reconcile;
pub mod ssh_launch;
pub mod status;
pub mod support;

#[cfg(test)]
mod testing;
