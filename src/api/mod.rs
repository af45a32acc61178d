//! HTTP control plane.

pub mod routes;

pub use routes::router;
