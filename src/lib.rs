#![doc(html_root_url = "https://docs.rs/encmount/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! encmount: mount front-end for user-space encrypted overlay filesystems
//!
//! Presents the decrypted view of an encrypted backing directory at a mount
//! point through FUSE, and manages the lifetime of that mount.
//!
//! ## Features
//!
//! - Permissive command-line processing with validation of paths and
//!   option combinations
//! - Foreground or daemon operation, single or multi-threaded
//! - Idle auto-unmount once no request has arrived for a number of minutes
//!   and no file is open
//! - Read-only mounts, attribute cache control and pass-through FUSE options
//! - `$STATUS$` / `$PROMPT$` annotation lines for wrapping front-ends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use encmount::{FuseTransport, OptionProcessor, Action, ServeDriver, SystemHost, SystemUnmounter};
//! use encmount::modules::context::Unmounter;
//! use std::sync::Arc;
//!
//! let argv: Vec<String> = vec![
//!     "encmount".into(), "--insecure".into(), "-f".into(),
//!     "/srv/raw".into(), "/mnt/plain".into(),
//! ];
//! let mut processor = OptionProcessor::new(&SystemHost);
//! if let Ok(Action::Mount(config)) = processor.process(&argv) {
//!     let unmounter: Arc<dyn Unmounter> = Arc::new(SystemUnmounter);
//!     let transport = FuseTransport::new(Arc::clone(&unmounter));
//!     let status = ServeDriver::new(config, transport, unmounter)
//!         .run(encmount::modules::plain::init_fs);
//!     println!("{:?}", status);
//! }
//! ```

pub mod modules;

pub use modules::driver::{ServeDriver, ServeStatus};
pub use modules::operations::{OperationTable, RootNode};
pub use modules::options::{Action, Config, OptionProcessor, OptionsError, SystemHost};
pub use modules::transport::{FuseTransport, Transport};
pub use modules::unmount::{SystemUnmounter, UnmountCommand};
