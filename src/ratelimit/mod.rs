//! Sliding-window admission logic and state management.

mod clock;
mod entry;
mod gate;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{LogEntry, RequestLog};
pub use gate::{Admission, Gate};
pub use window::{evaluate, WindowDecision, WindowPolicy, DEFAULT_CAPACITY, DEFAULT_WINDOW};
