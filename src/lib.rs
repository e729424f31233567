pub mod auth;
pub mod clock;
pub mod engine;
pub mod jobs;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod tls;
pub mod venue;
pub mod wal;
pub mod wire;
