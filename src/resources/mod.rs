pub mod app_binding;
pub mod common;
pub mod job;
pub mod pdb;
pub mod secret;
pub mod service;
pub mod statefulset;

pub use common::{FIELD_MANAGER, FINALIZER, owner_reference, standard_labels};
