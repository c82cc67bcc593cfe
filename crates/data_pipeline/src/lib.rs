pub mod buffer;
pub mod device;
pub mod matrix;
pub mod media;
pub mod pipeline;
pub mod reader;

pub use buffer::{Buffer, BufferTuple};
pub use device::{CpuDevice, Device, DeviceKind, DEVICE_SLOTS};
pub use media::{media_factory, MediaFactory, MediaTransformer, RawMedia};
pub use pipeline::{Loader, LoaderConfig, LoaderConfigBuilder, LoaderStats, TargetMode};
pub use reader::Reader;
