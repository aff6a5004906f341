//! Consumer connection daemon.
//!
//! Accepts TCP connections speaking the V2 consumer protocol and drives one
//! `courier_broker::Client` per connection: a command reader plus a message pump.
pub mod config;
pub mod observability;
pub mod protocol;
pub mod pump;
pub mod server;
pub mod tcp;
