//! Command-line and dependency-file fingerprints.
//!
//! Everything the cache keys on goes through the same streaming 128-bit
//! hash (XXH3), rendered as 32 lowercase hex digits.

use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{Context, Result};
use xxhash_rust::xxh3::Xxh3;

/// Help-flag groups the cache recognizes. An invocation is cacheable only
/// if at least one argument matches a group member; fingerprints always use
/// the canonical (first) member so `-h` and `--help` share an entry.
const HELP_FLAG_GROUPS: &[&[&str]] = &[
    &["-h", "--help"],
    &["-showparams", "--showparams"],
    &["-hh", "--help-all"],
];

/// A finalized 128-bit fingerprint.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Digest(u128);

impl Digest {
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Streaming wrapper around the hash primitive.
pub struct StreamHasher {
    state: Xxh3,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self { state: Xxh3::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }

    pub fn finish(self) -> Digest {
        Digest(self.state.digest128())
    }
}

impl Default for StreamHasher {
    fn default() -> Self {
        Self::new()
    }
}

fn help_flag_group(arg: &str) -> Option<&'static [&'static str]> {
    HELP_FLAG_GROUPS
        .iter()
        .copied()
        .find(|group| group.contains(&arg))
}

/// Whether any argument matches a recognized help flag.
pub fn has_help_flag(cmd: &[String]) -> bool {
    cmd.iter().any(|arg| help_flag_group(arg).is_some())
}

/// Fingerprint of a command line.
///
/// The first `prefix_len` arguments contribute their exact bytes (`None`
/// means all of them). Help flags contribute the canonical member of their
/// group at any position, so swapping `-h` for `--help` never changes the
/// fingerprint. Non-help arguments past the prefix contribute nothing, so
/// decorator-style invocations with extra trailing flags still hit.
pub fn command_fingerprint(prefix_len: Option<usize>, cmd: &[String]) -> String {
    let cut = prefix_len.unwrap_or(cmd.len()).min(cmd.len());
    let mut hasher = StreamHasher::new();
    for (i, arg) in cmd.iter().enumerate() {
        if let Some(group) = help_flag_group(arg) {
            hasher.update(group[0].as_bytes());
        } else if i < cut {
            hasher.update(arg.as_bytes());
        }
    }
    hasher.finish().to_hex()
}

/// Fingerprint of a dependency file: the path bytes, then the content
/// bytes.
///
/// Missing files (when `allow_missing`), unreadable files, non-regular
/// files, and empty files all collapse to the path-only fingerprint. A
/// replay that recorded the file as readable then fails to match, which is
/// the safe direction. Missing files with `allow_missing == false` and any
/// other OS failure are errors.
pub fn file_fingerprint(path: &Path, allow_missing: bool) -> Result<String> {
    let mut hasher = StreamHasher::new();
    hasher.update(path.as_os_str().as_bytes());

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound && allow_missing => {
            return Ok(hasher.finish().to_hex());
        }
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            return Ok(hasher.finish().to_hex());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("can't open '{}'", path.display()));
        }
    };

    let meta = file
        .metadata()
        .with_context(|| format!("can't stat '{}'", path.display()))?;
    if !meta.is_file() || meta.len() == 0 {
        return Ok(hasher.finish().to_hex());
    }

    let mut content = Vec::with_capacity(meta.len() as usize);
    file.read_to_end(&mut content)
        .with_context(|| format!("can't read '{}'", path.display()))?;
    hasher.update(&content);
    Ok(hasher.finish().to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn path_only(path: &Path) -> String {
        let mut hasher = StreamHasher::new();
        hasher.update(path.as_os_str().as_bytes());
        hasher.finish().to_hex()
    }

    #[test]
    fn digest_is_32_lowercase_hex() {
        let fp = command_fingerprint(None, &args(&["prog", "-h"]));
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let mut hasher = StreamHasher::new();
        hasher.update(b"abc");
        let digest = hasher.finish();
        assert_eq!(format!("{digest}"), digest.to_hex());
    }

    #[test]
    fn detects_help_flags() {
        assert!(has_help_flag(&args(&["prog", "--help"])));
        assert!(has_help_flag(&args(&["prog", "x", "-hh"])));
        assert!(has_help_flag(&args(&["prog", "-showparams"])));
        assert!(!has_help_flag(&args(&["prog", "run", "--fast"])));
        assert!(!has_help_flag(&args(&["prog", "--helpme"])));
    }

    #[test]
    fn help_flag_group_members_share_fingerprint() {
        let dash_h = command_fingerprint(None, &args(&["prog", "-h"]));
        assert_eq!(dash_h, command_fingerprint(None, &args(&["prog", "--help"])));
        assert_eq!(
            command_fingerprint(None, &args(&["prog", "-hh"])),
            command_fingerprint(None, &args(&["prog", "--help-all"]))
        );
        // Different groups stay distinct.
        assert_ne!(dash_h, command_fingerprint(None, &args(&["prog", "-hh"])));
    }

    #[test]
    fn non_help_args_past_prefix_are_ignored() {
        let a = command_fingerprint(Some(2), &args(&["prog", "a", "b", "-h"]));
        let b = command_fingerprint(Some(2), &args(&["prog", "a", "c", "-h"]));
        assert_eq!(a, b);
        // Reordering past the prefix does not matter either.
        let c = command_fingerprint(Some(2), &args(&["prog", "a", "-h", "zzz"]));
        assert_eq!(a, c);
    }

    #[test]
    fn every_prefix_argument_matters() {
        let base = command_fingerprint(Some(2), &args(&["prog", "a", "x"]));
        assert_ne!(base, command_fingerprint(Some(2), &args(&["prog", "b", "x"])));
        assert_ne!(
            command_fingerprint(Some(2), &args(&["prog", "x", "a"])),
            command_fingerprint(Some(2), &args(&["prog", "a", "a"]))
        );
    }

    #[test]
    fn negative_or_oversized_prefix_means_entire_argv() {
        let cmd = args(&["prog", "a", "b"]);
        assert_eq!(
            command_fingerprint(None, &cmd),
            command_fingerprint(Some(99), &cmd)
        );
        assert_ne!(
            command_fingerprint(None, &args(&["prog", "a", "b"])),
            command_fingerprint(None, &args(&["prog", "a", "c"]))
        );
    }

    #[test]
    fn file_fingerprint_is_deterministic_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dep");
        fs::write(&path, b"some help text").unwrap();

        let first = file_fingerprint(&path, false).unwrap();
        let second = file_fingerprint(&path, false).unwrap();
        assert_eq!(first, second);

        fs::write(&path, b"some help texU").unwrap();
        assert_ne!(first, file_fingerprint(&path, false).unwrap());
    }

    #[test]
    fn file_fingerprint_depends_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same content").unwrap();
        fs::write(&b, b"same content").unwrap();
        assert_ne!(
            file_fingerprint(&a, false).unwrap(),
            file_fingerprint(&b, false).unwrap()
        );
    }

    #[test]
    fn missing_file_hashes_path_only_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone");
        assert_eq!(file_fingerprint(&path, true).unwrap(), path_only(&path));
        assert!(file_fingerprint(&path, false).is_err());
    }

    #[test]
    fn empty_file_matches_path_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();
        assert_eq!(file_fingerprint(&path, false).unwrap(), path_only(&path));
    }

    #[test]
    fn directory_hashes_path_only() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            file_fingerprint(dir.path(), false).unwrap(),
            path_only(dir.path())
        );
    }
}
