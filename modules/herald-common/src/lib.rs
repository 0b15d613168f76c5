pub mod config;
pub mod error;
pub mod keys;
pub mod types;

pub use config::Config;
pub use error::HeraldError;
pub use types::{
    EventKind, Keep, KeepType, Realm, Snapshot, TrackedPlayer, WarEvent,
};
