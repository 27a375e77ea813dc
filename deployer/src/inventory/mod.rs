//! Host inventory

pub mod export;
pub mod proxmox;
pub mod store;

pub use store::InventoryStore;
