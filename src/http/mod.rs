//! HTTP surface: admission middleware, routes and server.

mod handlers;
mod middleware;
mod routes;
mod server;

pub use middleware::{enforce, Admission, ErrorResponse};
pub use routes::{router, RouteLimiters};
pub use server::HttpServer;
