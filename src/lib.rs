pub mod logging;

pub mod codec;
pub mod config;
pub mod crypto;
pub mod daemon_signer;
pub mod event;
pub mod read_state;
pub mod relay_transport;
pub mod relays;
pub mod service;
pub mod signer;
pub mod storage;
pub mod sync;
pub mod transport;
