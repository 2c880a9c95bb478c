use encmount::modules::context::Unmounter;
use encmount::modules::daemon::Daemon;
use encmount::modules::logging;
use encmount::modules::options::{engine_usage, usage, utf8_args};
use encmount::modules::plain;
use encmount::{
    Action, FuseTransport, OptionProcessor, OptionsError, ServeDriver, SystemHost,
    SystemUnmounter, UnmountCommand,
};
use log::debug;
use nix::sys::stat::{umask, Mode};
use std::env;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

fn main() -> ExitCode {
    let fallback = env!("CARGO_PKG_NAME");
    let argv = match utf8_args(env::args_os()) {
        Ok(argv) => argv,
        Err(e) => {
            eprintln!("{}: {}", fallback, e);
            return ExitCode::FAILURE;
        }
    };
    let program = argv.first().map(String::as_str).unwrap_or(fallback);

    let host = SystemHost;
    let mut processor = OptionProcessor::new(&host);
    let outcome = processor.process(&argv);
    for warning in processor.warnings() {
        eprintln!("{}: {}", program, warning);
    }

    let action = match outcome {
        Ok(action) => action,
        Err(e) => {
            if e != OptionsError::NoArguments {
                eprintln!("{}", e);
            }
            eprint!("{}", usage(program));
            return ExitCode::FAILURE;
        }
    };

    let config = match action {
        Action::ShowVersion { .. } => {
            eprintln!(
                "{} version {}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            );
            return ExitCode::SUCCESS;
        }
        Action::ShowEngineHelp => {
            eprint!("{}", engine_usage(program));
            return ExitCode::SUCCESS;
        }
        Action::Unmount(config) => {
            logging::init(&config);
            return UnmountCommand::new(&config.opts.unmount_point)
                .run(&SystemUnmounter, &mut io::stdout())
                .into();
        }
        Action::Mount(config) => config,
    };

    logging::init(&config);
    debug!("Root directory: {}", config.opts.root_dir);
    debug!("Fuse arguments: {}", config);

    // Permissions requested by callers are applied as given
    umask(Mode::empty());

    let unmounter: Arc<dyn Unmounter> = Arc::new(SystemUnmounter);
    let daemonize = config.daemonize;
    let mut driver = ServeDriver::new(
        config,
        FuseTransport::new(Arc::clone(&unmounter)),
        unmounter,
    );
    if daemonize {
        driver = driver.daemonize_with(Daemon::new());
    }

    driver.run(plain::init_fs).into()
}
