pub mod ancillary;
pub mod cli;
pub mod config;
pub mod driver_local;
pub mod driver_remote;
pub mod error;
pub mod fifo;
pub mod listener;
pub mod logging;
pub mod peer;
pub mod queue;
pub mod router;
