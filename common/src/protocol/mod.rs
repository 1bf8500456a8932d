pub mod compact;
pub mod frame;
pub mod payload;

pub use compact::{CompactRecord, RECORD_LEN};
pub use frame::{check_device_id, Frame, FrameError, FrameReader, MAX_PAYLOAD_LEN};
pub use payload::{PayloadCodec, PayloadError, WireProfile};
