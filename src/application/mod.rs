//! Application services: producer, consumer pipeline, review and queries.

pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod middleware;
pub mod outcome;
pub mod producer;
pub mod queries;
pub mod repos;
pub mod resilience;
pub mod review;
pub mod workers;
