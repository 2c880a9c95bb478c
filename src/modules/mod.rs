//! Core mount modules.
//!
//! - `constants`: timeouts, limits and annotation tags
//! - `options`: command-line processing and validation
//! - `context`: shared per-mount state and idle accounting
//! - `supervisor`: the idle auto-unmount thread
//! - `operations`: the root node trait and the FUSE dispatch table
//! - `transport`: the FUSE engine seam
//! - `driver`: mount, serve and teardown
//! - `unmount`: platform unmount and the `--unmount` action
//! - `daemon`: detaching from the terminal
//! - `logging`: stderr or syslog output
//! - `plain`: the null-cipher engine

pub mod constants;
pub mod context;
pub mod daemon;
pub mod driver;
pub mod logging;
pub mod operations;
pub mod options;
pub mod plain;
pub mod supervisor;
pub mod transport;
pub mod unmount;
