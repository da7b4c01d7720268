//! Concrete object service implementations
//!
//! [`LocalObjectStore`] keeps objects and multipart sessions in a local
//! directory. It backs the command line tool and the integration tests; real
//! services are reached through [`crate::protocol::http::HttpObjectService`].

pub mod local;

pub use local::LocalObjectStore;
