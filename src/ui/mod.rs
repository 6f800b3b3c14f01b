// Terminal presentation: live job progress and operator-facing tables

pub mod progress;


pub use progress::{format_log_line, render_devices, render_plan, render_summary, ProgressView};
