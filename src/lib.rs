pub mod candidates;
pub mod canonical;
pub mod config;
pub mod entity;
pub mod error;
pub mod merge;
pub mod oracle;
pub mod review;
pub mod scoring;
pub mod store;

pub use error::ResolveError;
