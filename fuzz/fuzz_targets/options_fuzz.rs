#![no_main]
use arbitrary::Arbitrary;
use encmount::modules::options::{DirRole, Host, OptionProcessor};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Invocation {
    args: Vec<String>,
    privileged: bool,
    existing_dirs: Vec<String>,
}

struct FuzzHost<'a> {
    privileged: bool,
    existing_dirs: &'a [String],
}

impl Host for FuzzHost<'_> {
    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn is_directory(&self, path: &str) -> bool {
        self.existing_dirs.iter().any(|dir| dir == path)
    }

    fn allow_mkdir(&self, _role: DirRole, _path: &str, _mode: u32, _annotate: bool) -> bool {
        false
    }
}

fuzz_target!(|input: Invocation| {
    let host = FuzzHost {
        privileged: input.privileged,
        existing_dirs: &input.existing_dirs,
    };
    let mut argv = vec!["encmount".to_string()];
    argv.extend(input.args);

    let mut processor = OptionProcessor::new(&host);
    if let Ok(encmount::Action::Mount(config)) = processor.process(&argv) {
        let args = config.engine_args.as_slice();
        assert_eq!(args[1], config.opts.mount_point);
        assert!(config.opts.mount_point.ends_with('/'));
        assert!(config.opts.root_dir.ends_with('/'));
    }
});
