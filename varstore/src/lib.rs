//! Declarative binary layouts and sealed firmware variable stores.
//! `layout` turns a JSON descriptor into an addressable, resizable byte tree;
//! `store` encrypts and authenticates a variable store held in such a tree.

pub mod crypto;
pub mod descriptor;
pub mod export;
pub mod layout;
pub mod store;

pub use descriptor::{load_descriptor, Descriptor};
pub use layout::{FieldValue, LayoutError, LayoutTree};
pub use store::{seal, SealedStore, StoreError};
