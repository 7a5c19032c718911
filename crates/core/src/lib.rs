pub mod array;
pub mod config;
pub mod error;
pub mod meta;
pub mod roi;
pub mod value;

pub use array::{Buffer, DType, Element, NdArray};
pub use config::{RoiflowConfig, SchedulerConfig};
pub use error::*;
pub use meta::{default_axis_order, AxisTags, Metadata};
pub use roi::{AxisSlice, Roi, Shape, SliceSpec};
pub use value::Value;
