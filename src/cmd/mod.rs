//! CLI command implementations.
//!
//! | Module   | Commands handled                        |
//! |----------|-----------------------------------------|
//! | `serve`  | `Serve`, `Run`                          |
//! | `jobs`   | `Status`, `List`, `Cancel`, `Compare`   |
//! | `config` | `Config`                                |

pub mod config;
pub mod jobs;
pub mod serve;

pub use config::cmd_config;
pub use jobs::{cmd_cancel, cmd_compare, cmd_list, cmd_status};
pub use serve::{cmd_run, cmd_serve};
