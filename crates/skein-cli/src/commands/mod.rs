pub mod config;
pub mod loopback;
