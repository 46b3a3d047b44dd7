pub mod broker;
pub mod command;
pub mod config;
pub mod display;
pub mod error;
pub mod health;
pub mod logging;
pub mod net;
pub mod ota;
pub mod process;
pub mod runtime;
pub mod scheduler;
pub mod sensor;
pub mod simulate;
pub mod storage;
pub mod types;
