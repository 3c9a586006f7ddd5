pub mod agent;
pub mod config;
pub mod reconcile;
pub mod run;
