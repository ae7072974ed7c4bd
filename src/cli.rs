//! The host CLI surface (§6.6): drive-letter jail mappings and the guest EXE path. Everything
//! else about running a guest is this crate's job; this module only owns the argument grammar
//! and the translation from `-C: /some/dir` into the [`DriveMap`] the loader and VFS syscalls
//! consume.
//!
//! The grammar (`-A: <dir>` through `-Z: <dir>`, one flag per drive letter, plus the legacy
//! `--jail <dir>` alias for `-C:`) has as many flag spellings as there are drive letters, which
//! a derive-based parser cannot express statically. A hand-rolled scan over `argv` is the
//! idiomatic fit here, not a dependency pulled in to generate ninety-nine cases of the same
//! rule.

use crate::error::VfsError;
use crate::vfs::DriveMap;
use std::path::PathBuf;

/// The parsed, validated form of the process's `argv`: a drive map with at least one entry, and
/// the guest EXE path as given on the command line (still in Windows/NT form; the loader
/// resolves it through the drive map itself).
pub struct Config {
    pub drives: DriveMap,
    pub exe: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("no drive mapping given (use -C: <dir> or --jail <dir>)")]
    NoDrives,
    #[error("flag '{0}' is missing its directory argument")]
    MissingValue(String),
    #[error("unrecognized argument '{0}'")]
    Unrecognized(String),
    #[error("no guest executable path given")]
    NoExe,
    #[error("more than one positional argument given ('{0}' and '{1}')")]
    MultipleExe(String, String),
    #[error(transparent)]
    Vfs(#[from] VfsError),
}

/// `-A: <dir>` through `-Z: <dir>`, case-insensitive, with or without the trailing colon.
fn drive_letter_flag(arg: &str) -> Option<char> {
    let rest = arg.strip_prefix('-')?;
    let rest = rest.strip_suffix(':').unwrap_or(rest);
    let mut chars = rest.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Some(c.to_ascii_uppercase()),
        _ => None,
    }
}

/// Parses an already-collected argument vector (`argv[1..]`) into a [`Config`]. Split out from
/// [`parse_args`] so tests can feed fixed vectors without touching the real process args.
pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Config, CliError> {
    let mut drives = DriveMap::new();
    let mut exe: Option<String> = None;

    let mut iter = args.into_iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "--jail" {
            let dir = iter.next().ok_or_else(|| CliError::MissingValue(arg.clone()))?;
            drives.insert('C', PathBuf::from(dir));
        } else if let Some(letter) = drive_letter_flag(&arg) {
            let dir = iter.next().ok_or_else(|| CliError::MissingValue(arg.clone()))?;
            drives.insert(letter, PathBuf::from(dir));
        } else if arg.starts_with('-') {
            return Err(CliError::Unrecognized(arg));
        } else {
            match exe {
                None => exe = Some(arg),
                Some(prior) => return Err(CliError::MultipleExe(prior, arg)),
            }
        }
    }

    if drives.get('C').is_none() && drives.get('A').is_none() {
        return Err(CliError::NoDrives);
    }

    Ok(Config { drives, exe: exe.ok_or(CliError::NoExe)? })
}

/// Parses the real process's `argv` (per §6.6).
pub fn parse_args() -> Result<Config, CliError> {
    parse(std::env::args().skip(1))
}

/// Installs the `env_logger` backend for the `log` facade every subsystem in this crate logs
/// through. A frontend embedding this crate calls this once before [`crate::VmContext::boot`];
/// the usual `RUST_LOG=wbox=debug` controls verbosity.
pub fn init_logging() {
    env_logger::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn jail_alias_maps_to_drive_c() {
        let cfg = parse(args(&["--jail", "/tmp/root", r"C:\hello.exe"])).unwrap();
        assert_eq!(cfg.drives.get('C'), Some(std::path::Path::new("/tmp/root")));
        assert_eq!(cfg.exe, r"C:\hello.exe");
    }

    #[test]
    fn repeated_drive_flags_populate_the_map() {
        let cfg = parse(args(&["-C:", "/srv/c", "-D:", "/srv/d", r"C:\hello.exe"])).unwrap();
        assert_eq!(cfg.drives.get('C'), Some(std::path::Path::new("/srv/c")));
        assert_eq!(cfg.drives.get('D'), Some(std::path::Path::new("/srv/d")));
    }

    #[test]
    fn drive_flag_without_colon_is_also_accepted() {
        let cfg = parse(args(&["-c", "/srv/c", r"C:\hello.exe"])).unwrap();
        assert_eq!(cfg.drives.get('C'), Some(std::path::Path::new("/srv/c")));
    }

    #[test]
    fn missing_drive_mapping_is_rejected() {
        assert!(matches!(parse(args(&[r"C:\hello.exe"])), Err(CliError::NoDrives)));
    }

    #[test]
    fn missing_exe_is_rejected() {
        assert!(matches!(parse(args(&["-C:", "/srv/c"])), Err(CliError::NoExe)));
    }

    #[test]
    fn unrecognized_flag_is_rejected() {
        assert!(matches!(parse(args(&["--bogus", r"C:\hello.exe"])), Err(CliError::Unrecognized(_))));
    }

    #[test]
    fn second_positional_argument_is_rejected() {
        assert!(matches!(
            parse(args(&["-C:", "/srv/c", r"C:\hello.exe", r"C:\other.exe"])),
            Err(CliError::MultipleExe(_, _))
        ));
    }
}
