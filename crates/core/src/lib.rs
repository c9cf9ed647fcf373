//! Core types, watermarks, and error taxonomy for the sensor pipeline.

pub mod checkpoint;
pub mod constants;
pub mod enriched;
pub mod error;
pub mod events;
pub mod schema;
pub mod sink;
pub mod watermark;
pub mod window;

pub use checkpoint::*;
pub use enriched::*;
pub use error::{Error, Result};
pub use events::*;
pub use schema::decode_sensor_event;
pub use sink::Sink;
pub use watermark::*;
pub use window::*;
