pub mod clean;
pub mod config;
pub mod dimensions;
pub mod error;
pub mod facts;
pub mod model;
pub mod pipeline;
pub mod raw;
pub mod record;
pub mod report;
pub mod schema;
pub mod store;
