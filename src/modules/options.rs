//! Command-line processing.
//!
//! Turns the raw argument vector into a validated [`Config`]. Parsing is
//! permissive: unknown options and options that are missing their argument
//! are reported as warnings and skipped. Only the validation pass that runs
//! after parsing can reject an invocation.

use super::constants::*;
use clap::{ArgAction, Command, CommandFactory, Parser};
use std::ffi::OsString;
use std::fmt;
use std::fs::DirBuilder;
use std::io::{self, BufRead, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Reasons an invocation is rejected.
///
/// Every variant renders as the message shown to the user before the usage
/// text is printed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptionsError {
    /// Nothing but the program name was given.
    #[error("No arguments given.")]
    NoArguments,
    /// `--unmount` needs exactly the mount point.
    #[error("Expecting one argument, aborting.")]
    UnmountArity,
    /// Normal mode needs a source directory and a mount point.
    #[error("Missing one or more arguments, aborting.")]
    MissingArguments,
    /// Daemon mode was requested with a relative path.
    #[error("When specifying daemon mode, you must use absolute paths (beginning with '/')")]
    RelativePath,
    /// The source directory sits below the mount point.
    #[error("The raw directory may not be a subdirectory of the mount point.")]
    RootInsideMountPoint,
    /// `--delaymount` was given without `--ondemand`.
    #[error("You must use mount-on-demand with delay-mount")]
    DelayMountRequiresOnDemand,
    /// `--ondemand` was given without `--extpass`.
    #[error("Must set password program when using mount-on-demand")]
    OnDemandRequiresPasswordProgram,
    /// The source directory is missing and was not created.
    #[error("Unable to locate root directory, aborting.")]
    MissingRootDir,
    /// The mount point is missing and was not created.
    #[error("Unable to locate mount point, aborting.")]
    MissingMountPoint,
    /// The platform requires the mount point to be absent.
    #[error("Mount point must not exist before mounting, aborting.")]
    MountPointExists,
    /// The argument parser rejected the sanitized argument list.
    #[error("{0}")]
    Parse(String),
    /// An argument is not valid UTF-8; carries its lossy rendering.
    #[error("Argument is not valid UTF-8: {0}")]
    NotUtf8(String),
}

/// Converts the raw process arguments into strings.
///
/// Arguments that are not valid UTF-8 are reported instead of aborting the
/// process.
pub fn utf8_args(args: impl IntoIterator<Item = OsString>) -> Result<Vec<String>, OptionsError> {
    args.into_iter()
        .map(|arg| {
            arg.into_string()
                .map_err(|raw| OptionsError::NotUtf8(raw.to_string_lossy().into_owned()))
        })
        .collect()
}

/// The engine argument vector did not fit the engine's fixed-size table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("too many engine arguments: {count} given, at most {max} supported")]
pub struct TooManyEngineArgs {
    /// Number of arguments collected.
    pub count: usize,
    /// Capacity of the engine's argument table.
    pub max: usize,
}

/// Key derivation presets used when a new volume has to be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigMode {
    /// Ask the user interactively.
    #[default]
    Prompt,
    /// Standard preset.
    Standard,
    /// Paranoia preset.
    Paranoia,
}

/// Ordered argument list handed to the kernel transport.
///
/// Slot 0 holds the program name and slot 1 the mount point; the mount
/// point is filled in once validation has succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineArgs {
    args: Vec<String>,
}

impl EngineArgs {
    /// Creates the vector with the program name and an empty mount point slot.
    pub fn new(program: &str) -> Self {
        Self {
            args: vec![last_path_element(program), String::new()],
        }
    }

    /// Appends a pass-through argument.
    pub fn push(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    /// Fills the reserved mount point slot.
    pub fn set_mount_point(&mut self, mount_point: &str) {
        self.args[1] = mount_point.to_string();
    }

    /// Program name, without its directory.
    pub fn program(&self) -> &str {
        &self.args[0]
    }

    /// Mount point slot; empty until validation succeeded.
    pub fn mount_point(&self) -> &str {
        &self.args[1]
    }

    /// The whole vector, program name first.
    pub fn as_slice(&self) -> &[String] {
        &self.args
    }

    /// Number of arguments, including program name and mount point.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Never true once constructed; both reserved slots are always present.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Returns the arguments if they fit the engine's argument table.
    pub fn checked(&self) -> Result<&[String], TooManyEngineArgs> {
        if self.args.len() > MAX_ENGINE_ARGS {
            return Err(TooManyEngineArgs {
                count: self.args.len(),
                max: MAX_ENGINE_ARGS,
            });
        }
        Ok(&self.args)
    }
}

/// Options consumed by the encryption engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionOptions {
    /// Source (ciphertext) directory, always slash-terminated.
    pub root_dir: String,
    /// Mount point, always slash-terminated.
    pub mount_point: String,
    /// Mount point exactly as the user gave it; used for unmounting.
    pub unmount_point: String,
    /// Volume configuration file overriding the default location.
    pub config: Option<PathBuf>,
    /// External password program.
    pub password_program: Option<String>,
    /// Read the password from stdin.
    pub use_stdin: bool,
    /// Read the password from the environment.
    pub use_env: bool,
    /// Verify the key against the volume's checksum.
    pub check_key: bool,
    /// Return data even when block MACs fail.
    pub force_decode: bool,
    /// Create files as the calling user (`--public`).
    pub owner_create: bool,
    /// Present an encrypted view of a plaintext directory.
    pub reverse_encryption: bool,
    /// Refuse every mutation.
    pub read_only: bool,
    /// Engine-side data cache disabled.
    pub no_cache: bool,
    /// Kernel attribute and entry caches disabled.
    pub no_attr_cache: bool,
    /// An idle timeout was given.
    pub idle_tracking: bool,
    /// Mount again on access after an idle unmount.
    pub mount_on_demand: bool,
    /// Postpone the first mount until access.
    pub delay_mount: bool,
    /// Refuse volumes without block MACs.
    pub require_mac: bool,
    /// Allow mounting without encryption.
    pub insecure: bool,
    /// Emit `$STATUS$` and `$PROMPT$` lines.
    pub annotate: bool,
    /// `--unmount` was requested.
    pub unmount: bool,
    /// Preset for configuring a new volume.
    pub config_mode: ConfigMode,
}

impl Default for EncryptionOptions {
    fn default() -> Self {
        Self {
            root_dir: String::new(),
            mount_point: String::new(),
            unmount_point: String::new(),
            config: None,
            password_program: None,
            use_stdin: false,
            use_env: false,
            check_key: true,
            force_decode: false,
            owner_create: false,
            reverse_encryption: false,
            read_only: false,
            no_cache: false,
            no_attr_cache: false,
            idle_tracking: false,
            mount_on_demand: false,
            delay_mount: false,
            require_mac: false,
            insecure: false,
            annotate: false,
            unmount: false,
            config_mode: ConfigMode::Prompt,
        }
    }
}

/// Validated runtime configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Detach from the terminal before serving.
    pub daemonize: bool,
    /// Let the engine serve requests on several threads.
    pub threaded: bool,
    /// Log at debug level.
    pub verbose: bool,
    /// Minutes of inactivity before self-unmount; 0 disables the supervisor.
    pub idle_timeout: u32,
    /// Tag every log line carries.
    pub syslog_tag: String,
    /// Arguments for the kernel transport.
    pub engine_args: EngineArgs,
    /// Options for the encryption engine.
    pub opts: EncryptionOptions,
}

impl Config {
    /// Configuration before any argument has been applied.
    pub fn defaults(program: &str) -> Self {
        Self {
            daemonize: true,
            threaded: true,
            verbose: false,
            idle_timeout: 0,
            syslog_tag: DEFAULT_SYSLOG_TAG.to_string(),
            engine_args: EngineArgs::new(program),
            opts: EncryptionOptions::default(),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.daemonize { "(daemon) " } else { "(fg) " })?;
        f.write_str(if self.threaded { "(threaded) " } else { "(UP) " })?;
        if self.idle_timeout > 0 {
            write!(f, "(timeout {}) ", self.idle_timeout)?;
        }
        let flags = [
            (self.opts.check_key, "keyCheck"),
            (self.opts.force_decode, "forceDecode"),
            (self.opts.owner_create, "ownerCreate"),
            (self.opts.use_stdin, "useStdin"),
            (self.opts.annotate, "annotate"),
            (self.opts.reverse_encryption, "reverseEncryption"),
            (self.opts.mount_on_demand, "mountOnDemand"),
            (self.opts.delay_mount, "delayMount"),
        ];
        for (_, name) in flags.iter().filter(|(set, _)| *set) {
            write!(f, "({}) ", name)?;
        }
        for arg in self.engine_args.as_slice() {
            write!(f, "{} ", arg)?;
        }
        Ok(())
    }
}

/// What the invocation asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Mount `root_dir` at `mount_point`.
    Mount(Config),
    /// Unmount `opts.unmount_point` and exit.
    Unmount(Config),
    /// Print the version and exit successfully.
    ShowVersion {
        /// `-v` was given as well.
        verbose: bool,
    },
    /// Print the engine's mount options and exit successfully.
    ShowEngineHelp,
}

/// Which directory a creation prompt is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirRole {
    /// The source directory.
    RootDir,
    /// The mount point.
    MountPoint,
}

impl DirRole {
    fn prompt(self) -> &'static str {
        match self {
            DirRole::RootDir => PROMPT_CREATE_ROOT_DIR,
            DirRole::MountPoint => PROMPT_CREATE_MOUNT_POINT,
        }
    }
}

/// Process and filesystem facts the validation pass depends on.
pub trait Host {
    /// True when the effective user may use `--public`.
    fn is_privileged(&self) -> bool;

    /// True when `path` names an existing directory.
    fn is_directory(&self, path: &str) -> bool;

    /// Asks whether a missing directory may be created and creates it.
    /// Returns true only if the directory now exists.
    fn allow_mkdir(&self, role: DirRole, path: &str, mode: u32, annotate: bool) -> bool;

    /// True on platforms where mounting over an existing directory fails.
    fn forbids_existing_mount_point(&self) -> bool {
        false
    }
}

/// [`Host`] backed by the running process and the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn is_directory(&self, path: &str) -> bool {
        Path::new(path).is_dir()
    }

    fn allow_mkdir(&self, role: DirRole, path: &str, mode: u32, annotate: bool) -> bool {
        {
            let mut err = io::stderr().lock();
            let _ = write!(
                err,
                "The directory \"{}\" does not exist. Should it be created? (y,N) ",
                path
            );
            if annotate {
                let _ = writeln!(err);
                let _ = writeln!(err, "{}", role.prompt());
            }
            let _ = err.flush();
        }

        let mut answer = String::new();
        let read = io::stdin().lock().read_line(&mut answer).unwrap_or(0);
        if read > 0 && matches!(answer.chars().next(), Some('y' | 'Y')) {
            return match DirBuilder::new().mode(mode).create(path) {
                Ok(()) => true,
                Err(e) => {
                    eprintln!("Unable to create directory: {}", e);
                    false
                }
            };
        }

        eprintln!("Directory not created.");
        false
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "encmount",
    disable_help_flag = true,
    disable_version_flag = true,
    args_override_self = true
)]
struct RawArgs {
    #[arg(short = 'H', long = "fuse-help")]
    engine_help: bool,
    #[arg(short = 's')]
    single_threaded: bool,
    #[arg(short = 'S', long = "stdinpass")]
    stdin_pass: bool,
    #[arg(short = 'E')]
    env_pass: bool,
    #[arg(short = 'f', long = "foreground")]
    foreground: bool,
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    #[arg(short = 'd', long = "fuse-debug")]
    engine_debug: bool,
    #[arg(short = 'm', long = "ondemand")]
    on_demand: bool,
    #[arg(short = 'M', long = "delaymount")]
    delay_mount: bool,
    #[arg(
        short = 'i',
        long = "idle",
        value_name = "MINUTES",
        value_parser = parse_minutes,
        allow_hyphen_values = true
    )]
    idle: Option<u32>,
    #[arg(short = 'o', value_name = "OPTION", action = ArgAction::Append, allow_hyphen_values = true)]
    engine_options: Vec<String>,
    #[arg(short = 't', long = "syslogtag", value_name = "TAG", allow_hyphen_values = true)]
    syslog_tag: Option<String>,
    #[arg(short = 'c', long = "config", value_name = "PATH", allow_hyphen_values = true)]
    config: Option<PathBuf>,
    #[arg(short = 'u', long = "unmount")]
    unmount: bool,
    #[arg(short = 'k', long = "anykey")]
    any_key: bool,
    #[arg(short = 'D', long = "forcedecode")]
    force_decode: bool,
    #[arg(short = 'r', long = "reverse")]
    reverse: bool,
    #[arg(short = 'R', long = "reversewrite")]
    reverse_write: bool,
    #[arg(short = 'P', long = "public")]
    public: bool,
    #[arg(short = 'p', long = "extpass", value_name = "PROGRAM", allow_hyphen_values = true)]
    password_program: Option<String>,
    #[arg(short = 'N', long = "no-default-flags")]
    no_default_flags: bool,
    #[arg(short = 'V', long = "version")]
    version: bool,
    #[arg(long = "annotate")]
    annotate: bool,
    #[arg(long = "nocache")]
    no_cache: bool,
    #[arg(long = "nodatacache")]
    no_data_cache: bool,
    #[arg(long = "noattrcache")]
    no_attr_cache: bool,
    #[arg(long = "require-macs")]
    require_macs: bool,
    #[arg(long = "insecure")]
    insecure: bool,
    #[arg(long = "standard")]
    standard: bool,
    #[arg(long = "paranoia")]
    paranoia: bool,
    #[arg(value_name = "ARGS")]
    positional: Vec<String>,
}

// Reads the minute count the way strtol would: leading digits, else 0.
fn parse_minutes(value: &str) -> Result<u32, String> {
    let digits: String = value
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Ok(digits.parse().unwrap_or(0))
}

/// Parses and validates an argument vector.
///
/// Warnings about skipped options accumulate in the processor and stay
/// available after [`OptionProcessor::process`] returns, whether it
/// succeeded or not.
pub struct OptionProcessor<'h, H: Host> {
    host: &'h H,
    warnings: Vec<String>,
}

impl<'h, H: Host> OptionProcessor<'h, H> {
    /// Creates a processor that asks `host` about the environment.
    pub fn new(host: &'h H) -> Self {
        Self {
            host,
            warnings: Vec::new(),
        }
    }

    /// Warnings collected while parsing.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Processes `argv`, including the program name in slot 0.
    ///
    /// # Returns
    ///
    /// * `Ok(Action)` describing what to do next
    /// * `Err(OptionsError)` when the invocation has to be rejected; the
    ///   caller prints the message and the usage text
    pub fn process(&mut self, argv: &[String]) -> Result<Action, OptionsError> {
        if argv.len() <= 1 {
            return Err(OptionsError::NoArguments);
        }

        let mut command = RawArgs::command();
        command.build();
        let sanitized = strip_unusable(&command, argv, &mut self.warnings);
        let raw = RawArgs::try_parse_from(sanitized)
            .map_err(|e| OptionsError::Parse(e.to_string().trim_end().to_string()))?;

        if raw.version {
            return Ok(Action::ShowVersion {
                verbose: raw.verbose,
            });
        }
        if raw.engine_help {
            return Ok(Action::ShowEngineHelp);
        }

        let mut config = Config::defaults(&argv[0]);
        let use_default_flags = self.apply(&raw, &mut config);

        if config.opts.unmount {
            return match raw.positional.as_slice() {
                [mount_point] => {
                    config.opts.unmount_point = mount_point.clone();
                    Ok(Action::Unmount(config))
                }
                _ => Err(OptionsError::UnmountArity),
            };
        }

        let (root_dir, mount_point, extra) = match raw.positional.as_slice() {
            [root_dir, mount_point, extra @ ..] => (root_dir, mount_point, extra),
            _ => return Err(OptionsError::MissingArguments),
        };
        config.opts.root_dir = slash_terminate(root_dir);
        config.opts.unmount_point = mount_point.clone();
        config.opts.mount_point = slash_terminate(mount_point);

        for arg in extra {
            config.engine_args.push(arg.as_str());
        }

        if use_default_flags {
            // stable inode numbers
            config.engine_args.push("-o");
            config.engine_args.push("use_ino");
            config.engine_args.push("-o");
            config.engine_args.push("default_permissions");
            if cfg!(target_os = "macos") {
                config.engine_args.push("-o");
                config.engine_args.push("local");
            }
        }

        self.validate(&config)?;

        let mount_point = config.opts.mount_point.clone();
        config.engine_args.set_mount_point(&mount_point);
        Ok(Action::Mount(config))
    }

    // Copies parsed flags into the configuration. Returns whether the
    // default engine flags should be appended.
    fn apply(&mut self, raw: &RawArgs, config: &mut Config) -> bool {
        let opts = &mut config.opts;
        let args = &mut config.engine_args;

        if raw.single_threaded {
            config.threaded = false;
        }
        if raw.verbose {
            config.verbose = true;
        }
        if let Some(tag) = &raw.syslog_tag {
            config.syslog_tag = tag.clone();
        }
        if let Some(minutes) = raw.idle {
            config.idle_timeout = minutes;
            opts.idle_tracking = true;
        }
        if raw.foreground {
            config.daemonize = false;
            args.push("-f");
        }
        if raw.unmount {
            // errors have to reach the console
            config.daemonize = false;
            opts.unmount = true;
        }
        if raw.engine_debug {
            args.push("-d");
        }

        opts.use_stdin = raw.stdin_pass;
        opts.use_env = raw.env_pass;
        opts.annotate = raw.annotate;
        opts.require_mac = raw.require_macs;
        opts.insecure = raw.insecure;
        opts.config = raw.config.clone();
        opts.check_key = !raw.any_key;
        opts.force_decode = raw.force_decode;
        opts.mount_on_demand = raw.on_demand;
        opts.delay_mount = raw.delay_mount;
        opts.password_program = raw.password_program.clone();

        if raw.reverse || raw.reverse_write {
            opts.reverse_encryption = true;
            // writes through a reverse view need --reversewrite
            opts.read_only = !raw.reverse_write;
        }

        opts.config_mode = if raw.paranoia {
            ConfigMode::Paranoia
        } else if raw.standard {
            ConfigMode::Standard
        } else {
            ConfigMode::Prompt
        };

        if raw.no_cache || raw.no_data_cache {
            opts.no_cache = true;
        }
        if raw.no_cache || raw.no_attr_cache {
            opts.no_attr_cache = true;
            args.push("-oattr_timeout=0");
            args.push("-oentry_timeout=0");
        }

        for option in &raw.engine_options {
            args.push("-o");
            args.push(option.as_str());
        }

        if raw.public {
            if self.host.is_privileged() {
                opts.owner_create = true;
                args.push("-o");
                args.push("allow_other");
            } else {
                self.warnings
                    .push("option '--public' ignored for non-root user".to_string());
            }
        }

        if !config.threaded {
            args.push("-s");
        }

        !raw.no_default_flags
    }

    fn validate(&self, config: &Config) -> Result<(), OptionsError> {
        let opts = &config.opts;

        if config.daemonize
            && (!opts.mount_point.starts_with('/') || !opts.root_dir.starts_with('/'))
        {
            return Err(OptionsError::RelativePath);
        }

        // Only this direction is checked; a mount point below the raw
        // directory is accepted.
        if opts.root_dir.starts_with(&opts.mount_point) {
            return Err(OptionsError::RootInsideMountPoint);
        }

        if opts.delay_mount && !opts.mount_on_demand {
            return Err(OptionsError::DelayMountRequiresOnDemand);
        }

        let has_password_program = opts
            .password_program
            .as_deref()
            .is_some_and(|program| !program.is_empty());
        if opts.mount_on_demand && !has_password_program {
            return Err(OptionsError::OnDemandRequiresPasswordProgram);
        }

        if !self.host.is_directory(&opts.root_dir)
            && !self
                .host
                .allow_mkdir(DirRole::RootDir, &opts.root_dir, NEW_DIR_MODE, opts.annotate)
        {
            return Err(OptionsError::MissingRootDir);
        }

        if self.host.forbids_existing_mount_point() {
            if self.host.is_directory(&opts.mount_point) {
                return Err(OptionsError::MountPointExists);
            }
        } else if !self.host.is_directory(&opts.mount_point)
            && !self.host.allow_mkdir(
                DirRole::MountPoint,
                &opts.mount_point,
                NEW_DIR_MODE,
                opts.annotate,
            )
        {
            return Err(OptionsError::MissingMountPoint);
        }

        Ok(())
    }
}

// Drops options the parser would reject, reporting each one. What is left
// parses cleanly, so a bad flag never aborts the whole run.
fn strip_unusable(command: &Command, argv: &[String], warnings: &mut Vec<String>) -> Vec<String> {
    let mut out = vec![argv[0].clone()];
    let mut rest = argv[1..].iter().cloned();

    while let Some(token) = rest.next() {
        if token == "--" {
            out.push(token);
            out.extend(rest.by_ref());
            break;
        }

        if let Some(long) = token.strip_prefix("--") {
            let (name, inline) = match long.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (long, None),
            };
            let Some(arg) = command.get_arguments().find(|a| a.get_long() == Some(name)) else {
                warnings.push(format!("unrecognized option '--{}'", name));
                continue;
            };
            if !arg.get_action().takes_values() {
                if inline.is_some() {
                    warnings.push(format!("option '--{}' doesn't allow an argument", name));
                } else {
                    out.push(token);
                }
                continue;
            }
            if inline.is_some() {
                out.push(token);
            } else if let Some(value) = rest.next() {
                out.push(token);
                out.push(value);
            } else {
                warnings.push(format!("option '--{}' requires an argument", name));
            }
            continue;
        }

        match token.strip_prefix('-') {
            Some(cluster) if !cluster.is_empty() => {
                strip_short_cluster(command, cluster, &mut rest, &mut out, warnings)
            }
            _ => out.push(token),
        }
    }

    out
}

fn strip_short_cluster(
    command: &Command,
    cluster: &str,
    rest: &mut impl Iterator<Item = String>,
    out: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    let mut kept = String::new();

    for (index, flag) in cluster.char_indices() {
        let Some(arg) = command.get_arguments().find(|a| a.get_short() == Some(flag)) else {
            warnings.push(format!("invalid option -- '{}'", flag));
            continue;
        };
        if !arg.get_action().takes_values() {
            kept.push(flag);
            continue;
        }

        // The rest of the cluster, or else the next token, is the value.
        let attached = &cluster[index + flag.len_utf8()..];
        if !attached.is_empty() {
            kept.push(flag);
            out.push(format!("-{}{}", kept, attached));
            return;
        }
        match rest.next() {
            Some(value) => {
                kept.push(flag);
                out.push(format!("-{}", kept));
                out.push(value);
            }
            None => {
                warnings.push(format!("option requires an argument -- '{}'", flag));
                if !kept.is_empty() {
                    out.push(format!("-{}", kept));
                }
            }
        }
        return;
    }

    if !kept.is_empty() {
        out.push(format!("-{}", kept));
    }
}

fn slash_terminate(path: &str) -> String {
    let mut result = path.to_string();
    if !result.ends_with('/') {
        result.push('/');
    }
    result
}

fn last_path_element(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Usage text printed when an invocation is rejected.
pub fn usage(program: &str) -> String {
    format!(
        "Build: {name} version {version}\n\n\
         Usage: {program} [options] rootDir mountPoint [-- [FUSE Mount Options]]\n\n\
         Common Options:\n\
         \x20 -H\t\t\tshow optional FUSE Mount Options\n\
         \x20 -s\t\t\tdisable multithreaded operation\n\
         \x20 -f\t\t\trun in foreground (don't spawn daemon).\n\
         \t\t\tError messages will be sent to stderr\n\
         \t\t\tinstead of syslog.\n\
         \x20 -v, --verbose\t\tverbose: output debug messages\n\
         \x20 -i, --idle=MINUTES\tAuto unmount after period of inactivity\n\
         \x20 --anykey\t\tDo not verify correct key is being used\n\
         \x20 --forcedecode\t\tdecode data even if an error is detected\n\
         \t\t\t(for filesystems using MAC block headers)\n\
         \x20 --public\t\tact as a typical multi-user filesystem\n\
         \t\t\t(must be run as root)\n\
         \x20 --reverse\t\treverse encryption\n\
         \x20 --reversewrite\t\treverse encryption with writes enabled\n\
         \x20 -c, --config=path\tspecifies config file (overrides ENV variable)\n\
         \x20 -u, --unmount\t\tunmounts specified mountPoint\n\
         \x20 --extpass=program\tUse external program for password prompt\n\
         \n\
         Example, to mount at ~/crypt with raw storage in ~/.crypt :\n\
         \x20   {program} ~/.crypt ~/crypt\n",
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        program = program,
    )
}

/// Mount options understood by the kernel transport, printed for `-H`.
pub fn engine_usage(program: &str) -> String {
    format!(
        "{program} [options] rootDir mountPoint -- [FUSE Mount Options]\n\
         valid FUSE Mount Options follow:\n\n\
         \x20   -f                     foreground operation\n\
         \x20   -s                     disable multi-threaded operation\n\
         \x20   -d                     enable debug output (implies -f)\n\
         \x20   -o allow_other         allow access to other users\n\
         \x20   -o allow_root          allow access to root\n\
         \x20   -o auto_unmount        auto unmount on process termination\n\
         \x20   -o default_permissions enable permission checking by kernel\n\
         \x20   -o fsname=NAME         set filesystem name\n\
         \x20   -o subtype=NAME        set filesystem type\n\
         \x20   -o ro / -o rw          read-only / read-write mount\n\
         \x20   -o dev, nodev, suid, nosuid, exec, noexec\n\
         \x20   -o atime, noatime, sync, async, dirsync\n\
         \x20   -o use_ino             let filesystem set inode numbers\n\
         \x20   -o attr_timeout=T      cache timeout for attributes, in seconds\n\
         \x20   -o entry_timeout=T     cache timeout for names, in seconds\n",
        program = program,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;

    #[derive(Default)]
    struct StubHost {
        privileged: bool,
        directories: HashSet<String>,
        allow_create: bool,
        forbid_existing: bool,
        mkdir_requests: RefCell<Vec<(DirRole, String)>>,
    }

    impl StubHost {
        fn with_dirs(dirs: &[&str]) -> Self {
            Self {
                directories: dirs.iter().map(|d| d.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    impl Host for StubHost {
        fn is_privileged(&self) -> bool {
            self.privileged
        }

        fn is_directory(&self, path: &str) -> bool {
            self.directories.contains(path)
        }

        fn allow_mkdir(&self, role: DirRole, path: &str, _mode: u32, _annotate: bool) -> bool {
            self.mkdir_requests.borrow_mut().push((role, path.to_string()));
            self.allow_create
        }

        fn forbids_existing_mount_point(&self) -> bool {
            self.forbid_existing
        }
    }

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("/usr/bin/encmount")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    fn standard_host() -> StubHost {
        StubHost::with_dirs(&["/d/crypt/", "/d/mnt/"])
    }

    fn mount(host: &StubHost, args: &[&str]) -> Result<Config, OptionsError> {
        match OptionProcessor::new(host).process(&argv(args))? {
            Action::Mount(config) => Ok(config),
            other => panic!("expected a mount, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults_for_plain_mount() {
        let host = standard_host();
        let config = mount(&host, &["/d/crypt", "/d/mnt"]).unwrap();

        assert!(config.daemonize);
        assert!(config.threaded);
        assert!(!config.verbose);
        assert_eq!(config.idle_timeout, 0);
        assert!(config.opts.check_key);
        assert!(!config.opts.no_cache);
        assert_eq!(config.syslog_tag, DEFAULT_SYSLOG_TAG);
        assert_eq!(config.opts.root_dir, "/d/crypt/");
        assert_eq!(config.opts.mount_point, "/d/mnt/");
        assert_eq!(config.opts.unmount_point, "/d/mnt");

        let args = config.engine_args.as_slice();
        assert_eq!(args[0], "encmount");
        assert_eq!(args[1], "/d/mnt/");
        assert_eq!(&args[2..6], ["-o", "use_ino", "-o", "default_permissions"]);
    }

    #[test]
    fn test_idle_with_password_program_passes() {
        let host = standard_host();
        let config = mount(&host, &["--idle=5", "-p", "extpass", "/d/crypt", "/d/mnt"]).unwrap();

        assert_eq!(config.idle_timeout, 5);
        assert!(config.opts.idle_tracking);
        assert!(!config.opts.mount_on_demand);
        assert_eq!(config.opts.password_program.as_deref(), Some("extpass"));
    }

    #[test]
    fn test_delay_mount_requires_on_demand() {
        let host = standard_host();
        let err = mount(&host, &["--delaymount", "/d/crypt", "/d/mnt"]).unwrap_err();
        assert_eq!(err, OptionsError::DelayMountRequiresOnDemand);
    }

    #[test]
    fn test_on_demand_requires_password_program() {
        let host = standard_host();
        let err = mount(&host, &["--ondemand", "/d/crypt", "/d/mnt"]).unwrap_err();
        assert_eq!(err, OptionsError::OnDemandRequiresPasswordProgram);

        let err = mount(&host, &["-m", "--extpass=", "/d/crypt", "/d/mnt"]).unwrap_err();
        assert_eq!(err, OptionsError::OnDemandRequiresPasswordProgram);

        let config = mount(&host, &["-m", "-M", "--extpass=askpass", "/d/crypt", "/d/mnt"]).unwrap();
        assert!(config.opts.mount_on_demand);
        assert!(config.opts.delay_mount);
    }

    #[test]
    fn test_root_dir_inside_mount_point_rejected() {
        let host = StubHost::with_dirs(&["/d/mnt/crypt/", "/d/mnt/"]);
        let err = mount(&host, &["/d/mnt/crypt", "/d/mnt"]).unwrap_err();
        assert_eq!(err, OptionsError::RootInsideMountPoint);

        let host = StubHost::with_dirs(&["/d/same/"]);
        let err = mount(&host, &["/d/same", "/d/same/"]).unwrap_err();
        assert_eq!(err, OptionsError::RootInsideMountPoint);
    }

    #[test]
    fn test_mount_point_inside_root_dir_accepted() {
        let host = StubHost::with_dirs(&["/d/", "/d/mnt/"]);
        let config = mount(&host, &["/d", "/d/mnt"]).unwrap();
        assert_eq!(config.opts.root_dir, "/d/");
    }

    #[test]
    fn test_relative_paths_rejected_in_daemon_mode() {
        let host = StubHost::with_dirs(&["crypt/", "/d/mnt/", "mnt/", "/d/crypt/"]);
        assert_eq!(
            mount(&host, &["crypt", "/d/mnt"]).unwrap_err(),
            OptionsError::RelativePath
        );
        assert_eq!(
            mount(&host, &["/d/crypt", "mnt"]).unwrap_err(),
            OptionsError::RelativePath
        );

        let config = mount(&host, &["-f", "crypt", "mnt"]).unwrap();
        assert!(!config.daemonize);
        assert!(config.engine_args.as_slice().contains(&"-f".to_string()));
    }

    #[test]
    fn test_unmount_requires_exactly_one_argument() {
        let host = standard_host();
        let mut processor = OptionProcessor::new(&host);
        assert_eq!(
            processor.process(&argv(&["-u"])).unwrap_err(),
            OptionsError::UnmountArity
        );
        assert_eq!(
            processor.process(&argv(&["--unmount", "/a", "/b"])).unwrap_err(),
            OptionsError::UnmountArity
        );

        match processor.process(&argv(&["-u", "/d/mnt"])).unwrap() {
            Action::Unmount(config) => {
                assert!(!config.daemonize);
                assert!(config.opts.unmount);
                assert_eq!(config.opts.unmount_point, "/d/mnt");
            }
            other => panic!("expected an unmount, got {:?}", other),
        }
    }

    #[test]
    fn test_unmount_skips_directory_checks() {
        let host = StubHost::default();
        let action = OptionProcessor::new(&host)
            .process(&argv(&["--unmount", "relative/mnt"]))
            .unwrap();
        assert!(matches!(action, Action::Unmount(_)));
        assert!(host.mkdir_requests.borrow().is_empty());
    }

    #[test]
    fn test_missing_positional_arguments() {
        let host = standard_host();
        assert_eq!(
            mount(&host, &["/d/crypt"]).unwrap_err(),
            OptionsError::MissingArguments
        );
        assert_eq!(
            OptionProcessor::new(&host).process(&argv(&[])).unwrap_err(),
            OptionsError::NoArguments
        );
    }

    #[test]
    fn test_unknown_options_are_reported_not_fatal() {
        let host = standard_host();
        let mut processor = OptionProcessor::new(&host);
        let action = processor
            .process(&argv(&["--bogus", "-vx", "/d/crypt", "/d/mnt", "--anykey=1", "-i"]))
            .unwrap();

        let Action::Mount(config) = action else {
            panic!("expected a mount");
        };
        assert!(config.verbose);
        assert!(config.opts.check_key);
        assert_eq!(config.idle_timeout, 0);

        let warnings = processor.warnings();
        assert!(warnings.contains(&"unrecognized option '--bogus'".to_string()));
        assert!(warnings.contains(&"invalid option -- 'x'".to_string()));
        assert!(warnings.contains(&"option '--anykey' doesn't allow an argument".to_string()));
        assert!(warnings.contains(&"option requires an argument -- 'i'".to_string()));
    }

    #[test]
    fn test_idle_minutes_parse_like_strtol() {
        let host = standard_host();
        assert_eq!(mount(&host, &["-i", "7min", "/d/crypt", "/d/mnt"]).unwrap().idle_timeout, 7);
        assert_eq!(mount(&host, &["-i", "soon", "/d/crypt", "/d/mnt"]).unwrap().idle_timeout, 0);
        assert_eq!(mount(&host, &["-fi12", "/d/crypt", "/d/mnt"]).unwrap().idle_timeout, 12);
    }

    #[test]
    fn test_public_requires_privilege() {
        let host = standard_host();
        let mut processor = OptionProcessor::new(&host);
        let Action::Mount(config) = processor.process(&argv(&["--public", "/d/crypt", "/d/mnt"])).unwrap() else {
            panic!("expected a mount");
        };
        assert!(!config.opts.owner_create);
        assert!(!config.engine_args.as_slice().contains(&"allow_other".to_string()));
        assert_eq!(processor.warnings(), ["option '--public' ignored for non-root user"]);

        let host = StubHost {
            privileged: true,
            ..standard_host()
        };
        let config = mount(&host, &["-P", "/d/crypt", "/d/mnt"]).unwrap();
        assert!(config.opts.owner_create);
        assert!(config.engine_args.as_slice().contains(&"allow_other".to_string()));
    }

    #[test]
    fn test_cache_flags() {
        let host = standard_host();

        let config = mount(&host, &["--nocache", "/d/crypt", "/d/mnt"]).unwrap();
        assert!(config.opts.no_cache);
        assert!(config.opts.no_attr_cache);
        let args = config.engine_args.as_slice();
        assert!(args.contains(&"-oattr_timeout=0".to_string()));
        assert!(args.contains(&"-oentry_timeout=0".to_string()));

        let config = mount(&host, &["--nodatacache", "/d/crypt", "/d/mnt"]).unwrap();
        assert!(config.opts.no_cache);
        assert!(!config.opts.no_attr_cache);
        assert!(!config.engine_args.as_slice().contains(&"-oattr_timeout=0".to_string()));

        let config = mount(&host, &["--noattrcache", "/d/crypt", "/d/mnt"]).unwrap();
        assert!(!config.opts.no_cache);
        assert!(config.opts.no_attr_cache);
        assert!(config.engine_args.as_slice().contains(&"-oentry_timeout=0".to_string()));
    }

    #[test]
    fn test_single_threaded_and_passthrough_arguments() {
        let host = standard_host();
        let config = mount(
            &host,
            &["-s", "-N", "-o", "ro", "/d/crypt", "/d/mnt", "--", "-o", "fsname=vault"],
        )
        .unwrap();

        assert!(!config.threaded);
        assert_eq!(
            config.engine_args.as_slice(),
            ["encmount", "/d/mnt/", "-o", "ro", "-s", "-o", "fsname=vault"]
        );
    }

    #[test]
    fn test_reverse_modes() {
        let host = standard_host();
        let config = mount(&host, &["--reverse", "/d/crypt", "/d/mnt"]).unwrap();
        assert!(config.opts.reverse_encryption);
        assert!(config.opts.read_only);

        let config = mount(&host, &["-R", "/d/crypt", "/d/mnt"]).unwrap();
        assert!(config.opts.reverse_encryption);
        assert!(!config.opts.read_only);
    }

    #[test]
    fn test_missing_directories_prompt_for_creation() {
        let host = StubHost::with_dirs(&["/d/mnt/"]);
        assert_eq!(
            mount(&host, &["/d/crypt", "/d/mnt"]).unwrap_err(),
            OptionsError::MissingRootDir
        );
        assert_eq!(
            host.mkdir_requests.borrow().as_slice(),
            [(DirRole::RootDir, "/d/crypt/".to_string())]
        );

        let host = StubHost {
            allow_create: true,
            ..StubHost::default()
        };
        mount(&host, &["/d/crypt", "/d/mnt"]).unwrap();
        assert_eq!(host.mkdir_requests.borrow().len(), 2);
        assert_eq!(host.mkdir_requests.borrow()[1].0, DirRole::MountPoint);

        let host = StubHost::with_dirs(&["/d/crypt/"]);
        assert_eq!(
            mount(&host, &["/d/crypt", "/d/mnt"]).unwrap_err(),
            OptionsError::MissingMountPoint
        );
    }

    #[test]
    fn test_existing_mount_point_rejected_where_forbidden() {
        let host = StubHost {
            forbid_existing: true,
            ..standard_host()
        };
        assert_eq!(
            mount(&host, &["/d/crypt", "/d/mnt"]).unwrap_err(),
            OptionsError::MountPointExists
        );

        let host = StubHost {
            forbid_existing: true,
            ..StubHost::with_dirs(&["/d/crypt/"])
        };
        mount(&host, &["/d/crypt", "/d/mnt"]).unwrap();
        assert!(host.mkdir_requests.borrow().is_empty());
    }

    #[test]
    fn test_version_and_engine_help_short_circuit() {
        let host = StubHost::default();
        let mut processor = OptionProcessor::new(&host);
        assert_eq!(
            processor.process(&argv(&["-v", "-V"])).unwrap(),
            Action::ShowVersion { verbose: true }
        );
        assert_eq!(processor.process(&argv(&["-H"])).unwrap(), Action::ShowEngineHelp);
    }

    #[test]
    fn test_config_summary() {
        let host = standard_host();
        let config = mount(&host, &["-i", "5", "-k", "/d/crypt", "/d/mnt"]).unwrap();
        let summary = config.to_string();

        assert!(summary.starts_with("(daemon) (threaded) (timeout 5) "));
        assert!(!summary.contains("(keyCheck)"));
        assert!(summary.contains("encmount /d/mnt/ -o use_ino"));
    }

    #[test]
    fn test_engine_args_capacity() {
        let mut args = EngineArgs::new("/sbin/encmount");
        assert_eq!(args.program(), "encmount");
        assert!(args.checked().is_ok());

        for i in 0..MAX_ENGINE_ARGS {
            args.push(format!("arg{}", i));
        }
        let err = args.checked().unwrap_err();
        assert_eq!(err.count, MAX_ENGINE_ARGS + 2);
        assert_eq!(err.max, MAX_ENGINE_ARGS);
    }

    #[test]
    fn test_non_utf8_argument_is_reported() {
        use std::os::unix::ffi::OsStringExt;

        let valid = utf8_args(["encmount", "/d/crypt", "/d/mnt"].map(OsString::from)).unwrap();
        assert_eq!(valid, ["encmount", "/d/crypt", "/d/mnt"]);

        let raw = vec![
            OsString::from("encmount"),
            OsString::from_vec(b"/d/cr\xffpt".to_vec()),
            OsString::from("/d/mnt"),
        ];
        let err = utf8_args(raw).unwrap_err();
        assert_eq!(err, OptionsError::NotUtf8("/d/cr\u{fffd}pt".to_string()));
        assert!(err.to_string().starts_with("Argument is not valid UTF-8"));
    }
}
