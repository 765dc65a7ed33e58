//! Broadcast plumbing for wave offers and acceptances.

pub mod hub;
pub mod subscription;

pub use hub::NotificationHub;
pub use subscription::Subscription;
