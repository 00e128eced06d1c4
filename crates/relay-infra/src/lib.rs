//! Infrastructure for the relay dispatcher: locating and loading `relay.toml`.

pub mod config;
