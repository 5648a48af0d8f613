pub mod circuit_breaker;
pub mod email;
pub mod error;
pub mod models;
pub mod mq;
pub mod sqlite_store;
