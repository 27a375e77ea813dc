//! ethdeploy
//!
//! Converges Ethereum consensus clients onto a host inventory: resolve a
//! deployment request into per-host step chains, run them through local,
//! SSH or Proxmox API backends, and keep durable per-step state so reruns
//! only do what is left.

pub mod app;
pub mod deploy;
pub mod engine;
pub mod errors;
pub mod filesys;
pub mod inventory;
pub mod logs;
pub mod models;
pub mod resolver;
pub mod state;
pub mod storage;
pub mod utils;
