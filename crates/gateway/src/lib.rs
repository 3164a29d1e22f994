// strand-gateway library entry point.

pub mod backend;
pub mod bridge;
pub mod config;
pub mod error;
pub mod runtime;
pub mod ws;
