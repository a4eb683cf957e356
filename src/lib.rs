pub mod clock;
pub mod config;
pub mod driver;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod record;
pub mod source;
