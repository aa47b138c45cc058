//! Real-time acquisition pipeline
//!
//! Ingests the multichannel sample stream of a remote acquisition server,
//! buffers it in a bounded ring buffer and republishes it, column by column,
//! on a typed measurement bus.
//!
//! ```text
//! data socket -> Producer -> RingBuffer -> Dispatcher -> MeasurementBus -> observers
//! ```
//!
//! [`AcquisitionPipeline`] ties the pieces to a [`rt_client::ControlClient`]
//! session and is what a host drives.

pub mod acquisition;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod plugin;
pub mod producer;
pub mod ring_buffer;

// Re-export commonly used types
pub use acquisition::*;
pub use bus::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use plugin::*;
pub use producer::*;
pub use ring_buffer::*;
