//! Child executable resolution and the direct-exec fallback used when
//! caching does not apply.

use std::ffi::CString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use nix::unistd::execvp;

/// Resolve `name` through `PATH` the way execvp would: names containing a
/// slash are used as-is, otherwise each `PATH` entry is probed (an empty
/// entry means the current directory) and only regular files with an
/// execute bit are accepted.
pub fn find_in_path(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        let meta = std::fs::metadata(&path).with_context(|| format!("can't stat '{name}'"))?;
        anyhow::ensure!(meta.is_file(), "'{name}' is not a regular file");
        return Ok(path);
    }

    let search = std::env::var("PATH").unwrap_or_default();
    for dir in search.split(':') {
        let candidate = if dir.is_empty() {
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(name),
                Err(_) => continue,
            }
        } else {
            Path::new(dir).join(name)
        };
        if let Ok(meta) = std::fs::metadata(&candidate) {
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return Ok(candidate);
            }
        }
    }

    Err(anyhow!("can't find '{name}' in PATH"))
}

/// Replace this process with the child command. Only returns on failure.
pub fn exec_child(cmd: &[String]) -> anyhow::Error {
    if cmd.is_empty() {
        return anyhow!("empty command");
    }
    let argv: Vec<CString> = match cmd
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
    {
        Ok(argv) => argv,
        Err(_) => return anyhow!("argument contains a NUL byte"),
    };
    match execvp(argv[0].as_c_str(), &argv) {
        Ok(infallible) => match infallible {},
        Err(errno) => anyhow!("can't exec '{}': {errno}", cmd[0]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_sh_in_path() {
        let path = find_in_path("sh").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn slash_names_bypass_path_search() {
        assert_eq!(find_in_path("/bin/sh").unwrap(), PathBuf::from("/bin/sh"));
        assert!(find_in_path("/no/such/binary").is_err());
    }

    #[test]
    fn unknown_names_are_errors() {
        assert!(find_in_path("definitely-not-a-real-binary-xyz").is_err());
    }
}
