//! Device communication layer for networked 3D printers.
//!
//! Every firmware binding implements [`PrinterAdapter`]; [`connect_adapter`]
//! picks the binding for a [`PrinterConfig`]. [`Discovery`] finds candidate
//! printers before any adapter exists.
//!
//! Service-advertisement browsing uses `mdns-sd` through the `mdns` feature,
//! on by default. Built with `default-features = false`, that strategy
//! reports no devices and the other strategies still run.

pub mod adapter;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod rest;
pub mod sdcp;
pub mod types;

pub use adapter::{connect_adapter, PrinterAdapter};
pub use config::{load_config, Config, DiscoveryConfig, PrinterConfig, RetryConfig};
pub use discovery::{dedup, DiscoveredDevice, Discovery, DiscoveryMethod};
pub use error::{AdapterError, ErrorKind};
pub use rest::{RestClient, RetryPolicy};
pub use sdcp::{SdcpAdapter, SdcpOptions};
pub use types::{
    Capabilities, Capability, CommandResult, DeviceState, JobProgress, PrinterKind, PrinterStatus,
    RemoteFile, UploadResult,
};
