//! Logging, the message sink, the health endpoint and webhook alerts.

pub mod alerts;
pub mod health;
pub mod logger;
pub mod messages;
