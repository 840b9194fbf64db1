use crate::{config::CommandLine, environment::Environment, error::ExecError};
use nix::{
    errno::Errno,
    unistd::{AccessFlags, access, execve},
};
use std::{
    convert::Infallible,
    env,
    ffi::{CString, NulError, OsStr, OsString},
    iter,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Started when no command is given.
pub const FALLBACK_SHELL: &str = "sh";

/// Finds the file to execute for `program`.
///
/// A name containing a slash is used as is. A bare name is looked up in
/// every directory of `search_path`, and the first executable regular file
/// wins.
pub fn resolve_program(program: &OsStr, search_path: Option<&OsStr>) -> Option<PathBuf> {
    if program.as_bytes().contains(&b'/') {
        return Some(PathBuf::from(program));
    }

    let search_path = search_path?;
    env::split_paths(search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

/// Replaces the current process with `command`, looked up through the
/// `PATH` of `environment`, which also becomes the process environment.
/// `argv[0]` is the program as given.
pub fn replace_process(
    command: Option<&CommandLine>,
    environment: &Environment,
) -> Result<Infallible, ExecError> {
    let (program, args) = match command {
        Some(command) => (command.program.as_os_str(), command.args.as_slice()),
        None => (OsStr::new(FALLBACK_SHELL), &[][..]),
    };

    let invalid = |_: NulError| ExecError::new(program, Errno::EINVAL);

    let path = resolve_program(program, environment.get("PATH"))
        .ok_or_else(|| ExecError::new(program, Errno::ENOENT))?;
    let path = CString::new(path.into_os_string().into_vec()).map_err(invalid)?;

    let argv = iter::once(program)
        .chain(args.iter().map(OsString::as_os_str))
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(invalid)?;
    let envp = environment.to_cstrings().map_err(invalid)?;

    debug!(path = ?path, argc = argv.len(), envc = envp.len(), "exec");
    execve(&path, &argv, &envp).map_err(|errno| ExecError::new(program, errno))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{environment::DEFAULT_PATH, utils::in_child};
    use std::{fs, os::unix::fs::PermissionsExt};

    fn script(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_resolve_searches_path_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        script(first.path(), "tool", 0o644);
        let expected = script(second.path(), "tool", 0o755);

        let search = env::join_paths([first.path(), second.path()]).unwrap();
        let resolved = resolve_program(OsStr::new("tool"), Some(search.as_os_str()));

        assert_eq!(resolved, Some(expected));
    }

    #[test]
    fn test_resolve_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("tool")).unwrap();

        let resolved = resolve_program(OsStr::new("tool"), Some(dir.path().as_os_str()));
        assert_eq!(resolved, None);
    }

    #[test]
    fn test_resolve_uses_paths_verbatim() {
        let resolved = resolve_program(OsStr::new("./run.sh"), None);
        assert_eq!(resolved, Some(PathBuf::from("./run.sh")));

        assert_eq!(resolve_program(OsStr::new("sh"), None), None);
    }

    #[test]
    fn test_missing_program_is_enoent() {
        let mut environment = Environment::default();
        environment.set("PATH", "/nonexistent");
        let command = CommandLine {
            program: "definitely-not-installed".into(),
            args: vec![],
        };

        let error = replace_process(Some(&command), &environment).unwrap_err();
        assert_eq!(error.errno, Errno::ENOENT);
        assert_eq!(error.program, "definitely-not-installed");
    }

    #[test]
    fn test_exec_passes_arguments_and_environment() {
        let mut environment = Environment::default();
        environment.set("PATH", DEFAULT_PATH);
        environment.set("EXIT_CODE", "7");
        let command = CommandLine {
            program: "sh".into(),
            args: vec!["-c".into(), "exit \"$EXIT_CODE\"".into()],
        };

        let code = in_child(|| match replace_process(Some(&command), &environment) {
            Ok(never) => match never {},
            Err(_) => 1,
        });
        assert_eq!(code, 7);
    }
}
