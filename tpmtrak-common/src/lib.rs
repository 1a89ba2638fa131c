pub mod health;
pub mod metrics;
pub mod pgqueue;
pub mod record;
