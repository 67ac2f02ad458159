//! Connection, session and module-action plumbing on top of `canopy-core`.

pub mod config;
pub mod controller;
pub mod module_action;
pub mod session;

pub use config::{
    ConnectionConfig, ControllerOptions, FileLoginStore, MemoryLoginStore, SavedLogin,
    SavedLoginStore,
};
pub use controller::{Controller, Controllers};
pub use module_action::{ModuleAction, ModuleActionResponse};
pub use session::{Credential, IdentityProvider, Session, StaticIdentity, UserState};
