pub mod config;
pub mod errors;
pub mod escalation;
pub mod factory;
pub mod logging;
pub mod reasoning;
pub mod repair;
pub mod validation;
pub mod workspace;
