//! `Kombo` Server: wave-based job dispatch over an axum HTTP surface.

pub mod dispatch;
pub mod network;
pub mod notify;
pub mod service;
pub mod storage;
pub mod traits;

pub use traits::{
    Backends, JobStore, NotificationChannel, PresenceStore, ProviderDirectory, PurchaseLedger,
};
