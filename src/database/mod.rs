//! # Database Layer
//!
//! - [`connection`] - Pool construction and health checks
//! - [`unit_of_work`] - Transactions that run hooks only after a successful commit

pub mod connection;
pub mod unit_of_work;

pub use connection::{connect_pool, health_check};
pub use unit_of_work::UnitOfWork;
