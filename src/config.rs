use crate::{
    context::InvocationContext,
    error::{ConfigError, ENV_ASSIGNMENT_LIMIT, PATH_LIMIT},
};
use clap::{ArgAction, ArgGroup, Args, Parser};
use nix::unistd::{Gid, Uid};
use std::{
    ffi::OsString,
    fs,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

const HEADING_ROOT: &str = "Root";
const HEADING_USER: &str = "User";
const HEADING_MOUNT: &str = "Mount";
const HEADING_ENVIRONMENT: &str = "Environment";
const HEADING_PROCESS: &str = "Process";

/// Uid and gid selected by `--as-user`.
pub const UNPRIVILEGED_ID: u32 = 1000;

/// Bind destinations under these directories (relative to the new root) are
/// created when they do not exist yet.
const RUNTIME_MOUNT_POINTS: [&str; 5] = ["run", "tmp", "var/run", "var/tmp", "dev/shm"];

#[derive(Parser, Debug)]
#[command(
    name = "rootbox",
    version,
    about = "Run a command in a private mount and pid namespace with its own root",
    after_help = "Without root, rootbox needs file capabilities:\n  sudo setcap cap_sys_admin,cap_sys_chroot,cap_setuid,cap_setgid,cap_chown+ep <path>"
)]
pub struct Cli {
    #[command(flatten)]
    pub root: RootOptions,

    #[command(flatten)]
    pub user: UserOptions,

    #[command(flatten)]
    pub mount: MountOptions,

    #[command(flatten)]
    pub env: EnvOptions,

    #[command(flatten)]
    pub process: ProcessOptions,

    /// Program and arguments to run (defaults to `sh`)
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub command: Vec<OsString>,
}

#[derive(Args, Debug)]
pub struct RootOptions {
    #[arg(
        short = 'r',
        long = "root",
        value_name = "DIR",
        default_value = "/",
        help = "New root directory",
        help_heading = HEADING_ROOT
    )]
    pub root: PathBuf,

    #[arg(
        short = 'd',
        long = "chdir",
        value_name = "DIR",
        default_value = "/",
        help = "Working directory inside the new root",
        help_heading = HEADING_ROOT
    )]
    pub chdir: PathBuf,

    #[arg(
        short = 'c',
        long,
        help = "Bind the current directory onto the working directory",
        help_heading = HEADING_ROOT
    )]
    pub bind_cwd: bool,
}

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("identity")
        .args(["as_root", "as_user"])
        .multiple(false)
))]
pub struct UserOptions {
    #[arg(
        short = 'u',
        long,
        help = "Run as this uid (defaults to the invoking uid)",
        conflicts_with = "identity",
        help_heading = HEADING_USER
    )]
    pub uid: Option<u32>,

    #[arg(
        short = 'g',
        long,
        help = "Run as this gid (defaults to the invoking gid)",
        conflicts_with = "identity",
        help_heading = HEADING_USER
    )]
    pub gid: Option<u32>,

    #[arg(
        short = 'R',
        long,
        help = "Shortcut for --uid 0 --gid 0",
        help_heading = HEADING_USER
    )]
    pub as_root: bool,

    #[arg(
        short = 'U',
        long,
        help = "Shortcut for --uid 1000 --gid 1000",
        help_heading = HEADING_USER
    )]
    pub as_user: bool,
}

#[derive(Args, Debug)]
pub struct MountOptions {
    #[arg(
        short = 'b',
        long = "bind",
        value_name = "SRC[:DST]",
        help = "Bind SRC to <root>/DST (DST defaults to SRC), repeatable",
        help_heading = HEADING_MOUNT
    )]
    pub binds: Vec<BindSpec>,

    #[arg(
        long,
        overrides_with = "no_proc",
        help = "Mount proc on /proc (default)",
        help_heading = HEADING_MOUNT
    )]
    pub proc: bool,

    #[arg(
        long,
        overrides_with = "proc",
        help = "Do not mount proc on /proc",
        help_heading = HEADING_MOUNT
    )]
    pub no_proc: bool,

    #[arg(long, help = "Mount sysfs on /sys", help_heading = HEADING_MOUNT)]
    pub sys: bool,

    #[arg(long, help = "Mount devtmpfs on /dev", help_heading = HEADING_MOUNT)]
    pub dev: bool,

    #[arg(
        long,
        help = "Mount devpts on /dev/pts, implies --dev",
        help_heading = HEADING_MOUNT
    )]
    pub devpts: bool,

    #[arg(
        long,
        help = "Mount a tmpfs on /run and create /run/user/<uid>",
        help_heading = HEADING_MOUNT
    )]
    pub run: bool,

    #[arg(long, help = "Mount a tmpfs on /tmp", help_heading = HEADING_MOUNT)]
    pub tmp: bool,

    #[arg(
        long,
        help = "Shortcut for --proc --sys --dev --devpts",
        help_heading = HEADING_MOUNT
    )]
    pub chroot: bool,

    #[arg(
        long = "runtime-link",
        value_name = "NAME:TARGET",
        requires = "run",
        help = "Create the symlink $XDG_RUNTIME_DIR/NAME -> TARGET, repeatable",
        help_heading = HEADING_MOUNT
    )]
    pub runtime_links: Vec<RuntimeLink>,
}

#[derive(Args, Debug)]
pub struct EnvOptions {
    #[arg(
        short = 'E',
        long,
        overrides_with = "keep_env",
        help = "Start from an empty environment",
        help_heading = HEADING_ENVIRONMENT
    )]
    pub clear_env: bool,

    #[arg(
        long,
        overrides_with = "clear_env",
        help = "Keep the inherited environment (default)",
        help_heading = HEADING_ENVIRONMENT
    )]
    pub keep_env: bool,

    #[arg(
        short = 'e',
        long = "env",
        value_name = "NAME=VALUE",
        help = "Set an environment variable, repeatable",
        help_heading = HEADING_ENVIRONMENT
    )]
    pub env: Vec<EnvAssignment>,
}

#[derive(Args, Debug)]
pub struct ProcessOptions {
    #[arg(
        short = 'i',
        long = "init",
        help = "Keep a minimal init as pid 1 that reaps orphaned processes",
        help_heading = HEADING_PROCESS
    )]
    pub act_as_init: bool,

    #[arg(
        long,
        help = "Set PR_SET_NO_NEW_PRIVS before running the command",
        help_heading = HEADING_PROCESS
    )]
    pub no_new_privs: bool,

    #[arg(
        short = 'v',
        long,
        action = ArgAction::Count,
        help = "Increase log verbosity, repeatable",
        help_heading = HEADING_PROCESS
    )]
    pub verbose: u8,
}

impl Cli {
    /// Validates the parsed flags and freezes them into a [`LaunchConfig`].
    pub fn into_launch_config(self, context: &InvocationContext) -> Result<LaunchConfig, ConfigError> {
        let root = canonical_root(&self.root.root)?;

        let working_dir = self.root.chdir;
        if !working_dir.is_absolute() {
            return Err(ConfigError::RelativeWorkingDir(working_dir));
        }

        let (uid, gid) = self.user.identity(context);

        let mount = self.mount;
        let mut binds = mount.binds;
        if self.root.bind_cwd {
            binds.push(BindSpec::new(context.cwd(), &working_dir)?);
        }

        let vfs = VfsFlags {
            proc: !mount.no_proc || mount.chroot,
            sys: mount.sys || mount.chroot,
            dev: mount.dev || mount.devpts || mount.chroot,
            devpts: mount.devpts || mount.chroot,
            run: mount.run,
            tmp: mount.tmp,
        };

        let mut command = self.command.into_iter();
        let command = command.next().map(|program| CommandLine {
            program,
            args: command.collect(),
        });

        Ok(LaunchConfig {
            root,
            working_dir,
            uid,
            gid,
            vfs,
            clear_env: self.env.clear_env,
            act_as_init: self.process.act_as_init,
            no_new_privs: self.process.no_new_privs,
            binds,
            env: self.env.env,
            runtime_links: mount.runtime_links,
            command,
        })
    }
}

impl UserOptions {
    fn identity(&self, context: &InvocationContext) -> (Uid, Gid) {
        if self.as_root {
            return (Uid::from_raw(0), Gid::from_raw(0));
        }

        if self.as_user {
            return (Uid::from_raw(UNPRIVILEGED_ID), Gid::from_raw(UNPRIVILEGED_ID));
        }

        (
            self.uid.map_or(context.ruid(), Uid::from_raw),
            self.gid.map_or(context.rgid(), Gid::from_raw),
        )
    }
}

fn canonical_root(root: &Path) -> Result<PathBuf, ConfigError> {
    let root = fs::canonicalize(root).map_err(|_| ConfigError::RootMissing(root.to_path_buf()))?;

    if !root.is_dir() {
        return Err(ConfigError::RootNotDirectory(root));
    }

    Ok(root)
}

/// Everything a launch needs, validated once and never modified.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Canonical path of the new root on the host.
    pub root: PathBuf,
    /// Absolute path inside the new root.
    pub working_dir: PathBuf,
    pub uid: Uid,
    pub gid: Gid,
    pub vfs: VfsFlags,
    pub clear_env: bool,
    pub act_as_init: bool,
    pub no_new_privs: bool,
    /// Applied in order; a later bind shadows an earlier one at the same destination.
    pub binds: Vec<BindSpec>,
    /// Applied in order; a later assignment replaces an earlier one of the same name.
    pub env: Vec<EnvAssignment>,
    pub runtime_links: Vec<RuntimeLink>,
    /// `None` starts an interactive shell.
    pub command: Option<CommandLine>,
}

/// Which virtual filesystems to provision inside the new root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VfsFlags {
    pub proc: bool,
    pub sys: bool,
    pub dev: bool,
    pub devpts: bool,
    pub run: bool,
    pub tmp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: OsString,
    pub args: Vec<OsString>,
}

/// A host path to bind into the new root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    source: PathBuf,
    /// Relative to the new root, no leading separator, no `..`.
    destination: PathBuf,
    create_missing: bool,
}

impl BindSpec {
    pub fn new(source: impl Into<PathBuf>, destination: &Path) -> Result<Self, ConfigError> {
        let source = source.into();
        let spec = || format!("{}:{}", source.display(), destination.display());

        if source.as_os_str().is_empty() {
            return Err(ConfigError::InvalidBind {
                spec: spec(),
                reason: "empty source",
            });
        }

        for path in [source.as_path(), destination] {
            let len = path.as_os_str().len();
            if len >= PATH_LIMIT {
                return Err(ConfigError::BindPathTooLong { len });
            }
        }

        let mut normalized = PathBuf::new();
        for component in destination.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(ConfigError::InvalidBind {
                        spec: spec(),
                        reason: "destination must not contain `..`",
                    });
                }
            }
        }

        let create_missing = RUNTIME_MOUNT_POINTS
            .iter()
            .any(|prefix| normalized.starts_with(prefix));

        Ok(Self {
            source,
            destination: normalized,
            create_missing,
        })
    }

    #[inline]
    pub fn source(&self) -> &Path {
        &self.source
    }

    #[inline]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Whether the destination is a runtime mount point that may be created.
    #[inline]
    pub fn create_missing(&self) -> bool {
        self.create_missing
    }

    /// Absolute host path of the destination under `root`.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(&self.destination)
    }
}

impl FromStr for BindSpec {
    type Err = ConfigError;

    /// Parses `SRC[:DST]`; a missing `DST` binds `SRC` onto the same path.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (source, destination) = match spec.split_once(':') {
            Some((source, "")) => (source, source),
            Some((source, destination)) => (source, destination),
            None => (spec, spec),
        };

        Self::new(source, Path::new(destination))
    }
}

/// A validated `NAME=VALUE` assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvAssignment {
    assignment: String,
    split: usize,
}

impl EnvAssignment {
    #[inline]
    pub fn name(&self) -> &str {
        &self.assignment[..self.split]
    }

    #[inline]
    pub fn value(&self) -> &str {
        &self.assignment[self.split + 1..]
    }
}

impl FromStr for EnvAssignment {
    type Err = ConfigError;

    fn from_str(assignment: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ConfigError::InvalidEnv {
            assignment: assignment.to_string(),
            reason,
        };

        if assignment.len() >= ENV_ASSIGNMENT_LIMIT {
            return Err(ConfigError::EnvTooLong {
                len: assignment.len(),
            });
        }

        if assignment.contains('\0') {
            return Err(invalid("contains a NUL byte"));
        }

        match assignment.find('=') {
            None => Err(invalid("expected NAME=VALUE")),
            Some(0) => Err(invalid("empty name")),
            Some(split) => Ok(Self {
                assignment: assignment.to_string(),
                split,
            }),
        }
    }
}

/// A symlink created inside the per-user runtime directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLink {
    pub name: PathBuf,
    /// Interpreted inside the new root.
    pub target: PathBuf,
}

impl FromStr for RuntimeLink {
    type Err = ConfigError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ConfigError::InvalidRuntimeLink {
            spec: spec.to_string(),
            reason,
        };

        let (name, target) = spec.split_once(':').ok_or_else(|| invalid("expected NAME:TARGET"))?;
        let name = PathBuf::from(name);

        let mut components = name.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(invalid("NAME must be a single path component")),
        }

        if target.is_empty() {
            return Err(invalid("empty TARGET"));
        }

        Ok(Self {
            name,
            target: PathBuf::from(target),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> InvocationContext {
        InvocationContext::fixed(1234, 5678, "/home/user/project", &[])
    }

    fn launch_config(args: &[&str]) -> Result<LaunchConfig, ConfigError> {
        let cli = Cli::try_parse_from(std::iter::once("rootbox").chain(args.iter().copied()))
            .expect("arguments parse");
        cli.into_launch_config(&context())
    }

    #[test]
    fn test_defaults() {
        let config = launch_config(&[]).unwrap();

        assert_eq!(config.root, PathBuf::from("/"));
        assert_eq!(config.working_dir, PathBuf::from("/"));
        assert_eq!(config.uid, Uid::from_raw(1234));
        assert_eq!(config.gid, Gid::from_raw(5678));
        assert_eq!(
            config.vfs,
            VfsFlags {
                proc: true,
                ..VfsFlags::default()
            }
        );
        assert!(!config.clear_env);
        assert!(!config.act_as_init);
        assert!(config.binds.is_empty());
        assert!(config.command.is_none());
    }

    #[test]
    fn test_identity_shortcuts() {
        let config = launch_config(&["--as-root"]).unwrap();
        assert_eq!((config.uid.as_raw(), config.gid.as_raw()), (0, 0));

        let config = launch_config(&["-U"]).unwrap();
        assert_eq!((config.uid.as_raw(), config.gid.as_raw()), (1000, 1000));

        let config = launch_config(&["-u", "42"]).unwrap();
        assert_eq!((config.uid.as_raw(), config.gid.as_raw()), (42, 5678));

        assert!(Cli::try_parse_from(["rootbox", "--as-root", "--uid", "5"]).is_err());
        assert!(Cli::try_parse_from(["rootbox", "--as-root", "--as-user"]).is_err());
    }

    #[test]
    fn test_mount_flags() {
        let config = launch_config(&["--devpts"]).unwrap();
        assert!(config.vfs.dev && config.vfs.devpts && config.vfs.proc);

        let config = launch_config(&["--no-proc", "--tmp", "--run"]).unwrap();
        assert!(!config.vfs.proc);
        assert!(config.vfs.tmp && config.vfs.run);

        let config = launch_config(&["--chroot"]).unwrap();
        assert!(config.vfs.proc && config.vfs.sys && config.vfs.dev && config.vfs.devpts);
        assert!(!config.vfs.tmp);

        let config = launch_config(&["--no-proc", "--proc"]).unwrap();
        assert!(config.vfs.proc);
    }

    #[test]
    fn test_clear_env_last_flag_wins() {
        assert!(launch_config(&["-E"]).unwrap().clear_env);
        assert!(!launch_config(&["-E", "--keep-env"]).unwrap().clear_env);
        assert!(launch_config(&["--keep-env", "--clear-env"]).unwrap().clear_env);
    }

    #[test]
    fn test_command_keeps_hyphenated_arguments() {
        let config = launch_config(&["-d", "/work", "--", "ls", "-la", "/"]).unwrap();
        let command = config.command.unwrap();

        assert_eq!(command.program, OsString::from("ls"));
        assert_eq!(command.args, vec![OsString::from("-la"), OsString::from("/")]);
    }

    #[test]
    fn test_relative_working_dir_is_rejected() {
        let error = launch_config(&["-d", "work"]).unwrap_err();
        assert!(matches!(error, ConfigError::RelativeWorkingDir(_)));
    }

    #[test]
    fn test_root_must_exist_and_be_a_directory() {
        let error = launch_config(&["-r", "/definitely/not/a/root"]).unwrap_err();
        assert!(matches!(error, ConfigError::RootMissing(_)));

        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        let error = launch_config(&["-r", path]).unwrap_err();
        assert!(matches!(error, ConfigError::RootNotDirectory(_)));
    }

    #[test]
    fn test_bind_cwd_is_appended_after_explicit_binds() {
        let config = launch_config(&["-b", "/usr", "-c", "-d", "/work", "-b", "/etc:/etc"]).unwrap();

        let destinations: Vec<_> = config.binds.iter().map(BindSpec::destination).collect();
        assert_eq!(
            destinations,
            vec![Path::new("usr"), Path::new("etc"), Path::new("work")]
        );
        assert_eq!(config.binds[2].source(), Path::new("/home/user/project"));
    }

    #[test]
    fn test_bind_spec_parsing() {
        let bind: BindSpec = "/home/user/project:/work".parse().unwrap();
        assert_eq!(bind.source(), Path::new("/home/user/project"));
        assert_eq!(bind.destination(), Path::new("work"));
        assert_eq!(bind.resolve(Path::new("/sandbox")), PathBuf::from("/sandbox/work"));
        assert!(!bind.create_missing());

        let bind: BindSpec = "/usr/lib".parse().unwrap();
        assert_eq!(bind.destination(), Path::new("usr/lib"));

        let bind: BindSpec = "/srv/data:".parse().unwrap();
        assert_eq!(bind.destination(), Path::new("srv/data"));

        let bind: BindSpec = "/x:///./opt//x".parse().unwrap();
        assert_eq!(bind.destination(), Path::new("opt/x"));
    }

    #[test]
    fn test_bind_spec_rejections() {
        assert!(matches!(
            ":/work".parse::<BindSpec>(),
            Err(ConfigError::InvalidBind { .. })
        ));
        assert!(matches!(
            "/etc:/work/../../etc".parse::<BindSpec>(),
            Err(ConfigError::InvalidBind { .. })
        ));

        let long = format!("/{}", "a".repeat(PATH_LIMIT));
        assert!(matches!(
            long.parse::<BindSpec>(),
            Err(ConfigError::BindPathTooLong { .. })
        ));
    }

    #[test]
    fn test_runtime_destinations_are_created_when_missing() {
        for spec in ["/a:/run/user/1000/bus", "/a:/tmp/.X11-unix", "/a:/var/tmp", "/a:/dev/shm"] {
            let bind: BindSpec = spec.parse().unwrap();
            assert!(bind.create_missing(), "{spec}");
        }

        let bind: BindSpec = "/a:/runner".parse().unwrap();
        assert!(!bind.create_missing());
    }

    #[test]
    fn test_env_assignment_parsing() {
        let assignment: EnvAssignment = "EDITOR=vi -u NONE".parse().unwrap();
        assert_eq!(assignment.name(), "EDITOR");
        assert_eq!(assignment.value(), "vi -u NONE");

        let assignment: EnvAssignment = "EMPTY=".parse().unwrap();
        assert_eq!(assignment.value(), "");

        let assignment: EnvAssignment = "OPTS=a=b".parse().unwrap();
        assert_eq!(assignment.name(), "OPTS");
        assert_eq!(assignment.value(), "a=b");
    }

    #[test]
    fn test_env_assignment_rejections() {
        assert!(matches!(
            "NOVALUE".parse::<EnvAssignment>(),
            Err(ConfigError::InvalidEnv { .. })
        ));
        assert!(matches!(
            "=value".parse::<EnvAssignment>(),
            Err(ConfigError::InvalidEnv { .. })
        ));

        let longest = format!("A={}", "x".repeat(ENV_ASSIGNMENT_LIMIT - 3));
        assert!(longest.parse::<EnvAssignment>().is_ok());

        let too_long = format!("A={}", "x".repeat(ENV_ASSIGNMENT_LIMIT - 2));
        assert!(matches!(
            too_long.parse::<EnvAssignment>(),
            Err(ConfigError::EnvTooLong { len }) if len == ENV_ASSIGNMENT_LIMIT
        ));

        assert!(Cli::try_parse_from(["rootbox", "-e", "BROKEN"]).is_err());
    }

    #[test]
    fn test_runtime_links() {
        let link: RuntimeLink = "wayland-0:/mnt/host/wayland-0".parse().unwrap();
        assert_eq!(link.name, PathBuf::from("wayland-0"));
        assert_eq!(link.target, PathBuf::from("/mnt/host/wayland-0"));

        assert!("wayland-0".parse::<RuntimeLink>().is_err());
        assert!("../escape:/x".parse::<RuntimeLink>().is_err());
        assert!("a/b:/x".parse::<RuntimeLink>().is_err());
        assert!("bus:".parse::<RuntimeLink>().is_err());

        assert!(Cli::try_parse_from(["rootbox", "--runtime-link", "bus:/x"]).is_err());
        let config = launch_config(&["--run", "--runtime-link", "bus:/x"]).unwrap();
        assert_eq!(config.runtime_links.len(), 1);
    }
}
