pub mod routes;
pub mod server;

pub use routes::routes;
pub use server::{HttpConfig, serve};
