pub mod time;

pub use time::{duration_secs, option_duration_secs};
