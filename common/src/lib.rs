pub mod config;
pub mod encryption;
pub mod error;
pub mod generator;
pub mod logging;
pub mod protocol;
pub mod types;

pub use config::*;
pub use error::{Result, TelemetryError};
pub use generator::ReadingGenerator;
pub use protocol::{Frame, FrameReader, PayloadCodec, WireProfile};
pub use types::*;
