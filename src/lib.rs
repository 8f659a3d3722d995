pub mod auth;
pub mod calendar;
pub mod clock;
pub mod compactor;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;
pub mod wire;
