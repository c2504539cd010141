//! CLI command implementations.
//!
//! | Module   | Commands handled                    |
//! |----------|-------------------------------------|
//! | `run`    | `Start`, `Next`, `Done`, `Resume`   |
//! | `status` | `Status`, `Events`, `Config`        |

pub mod run;
pub mod status;

pub use run::{cmd_done, cmd_next, cmd_resume, cmd_start};
pub use status::{cmd_config, cmd_events, cmd_status};
