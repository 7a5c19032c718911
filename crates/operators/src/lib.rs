//! Reference operators: pass-throughs, a dirty-notification counter and a
//! box-filter resampler.

mod array_piper;
mod progress;
mod resize;
mod track_slot_version;
mod value_piper;

pub use array_piper::OpArrayPiper;
pub use progress::ProgressSignal;
pub use resize::{input_roi_for, output_roi_for, OpResize};
pub use track_slot_version::OpTrackSlotVersion;
pub use value_piper::OpValuePiper;
