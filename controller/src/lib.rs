pub mod client;
pub mod device;
pub mod gateway;
pub mod host;
pub mod plugin;
pub mod printer;
pub mod scheduler;
pub mod store;
pub mod wizard;
pub mod worker;

pub use client::TradfriClient;
pub use device::{TradfriDevice, TradfriSocket};
pub use plugin::PowerController;
