mod connection;
pub mod server;
mod session;
