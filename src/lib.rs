//! Library crate for netprobe-proxy: TCP probing, reverse DNS, OUI vendor
//! lookups, upstream API proxying and the HTTP service exposing them.
pub mod error;
pub mod oui;
pub mod ports;
pub mod probe;
pub mod proxy;
pub mod publish;
pub mod rdns;
pub mod server;
pub mod types;
