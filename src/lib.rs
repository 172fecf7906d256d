pub mod channel;
pub mod config;
pub mod crypto;
pub mod pairing;
pub mod relay;
