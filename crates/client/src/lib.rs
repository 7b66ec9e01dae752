pub mod auth;
pub mod bot;
pub mod config;
pub mod events;
pub mod fleet;
pub mod recorder;
pub mod replay;
pub mod session;
pub mod shutdown;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
