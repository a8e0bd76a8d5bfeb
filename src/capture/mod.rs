//! Timed image capture.
//!
//! Two layers: the [`Coordinator`] owns the light and sensor state and knows
//! when a frame is valid (light settled, camera warmed up); the scheduler in
//! [`scheduler`] realizes a list of capture offsets against the clock on top
//! of it.

pub mod coordinator;
pub mod scheduler;

pub use coordinator::{CaptureConfig, Coordinator, TimedFrame};
pub use scheduler::{run_averaged, run_schedule, should_skip, CaptureSchedule, ScheduleOptions};
