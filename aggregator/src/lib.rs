pub mod aggregation;
pub mod api;
pub mod cfg;
pub mod crypto;
pub mod error;
pub mod message;
pub mod p2p;
pub mod peers;
pub mod validators;
