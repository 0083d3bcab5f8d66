//! CLI command handlers, one file per command.

mod cancel;
mod generate;
mod list;
mod run;
mod stats;
mod status;
mod submit;

pub use cancel::run_cancel;
pub use generate::{run_completions, run_manpage};
pub use list::run_list;
pub use run::run_scheduler;
pub use stats::run_stats;
pub use status::run_status;
pub use submit::run_submit;
