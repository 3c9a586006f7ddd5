pub mod identity;
pub mod process_backend;
pub mod process_tree;

pub use identity::{current_identity, platform_impersonation, CurrentIdentityOnly, Identity, Impersonation};
pub use process_backend::{ProcessBackend, ProcessExit, ProcessHandle};
