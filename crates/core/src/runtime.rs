use std::env;
use std::path::{Path, PathBuf};

use tokio::process::Command;

/// Directories searched before `PATH`, so a bundled ffmpeg wins:
///   1. `<exe_dir>/` and `<exe_dir>/bin/`
///   2. `<exe_dir>/../bin/`
///   3. `<cwd>/` and `<cwd>/bin/`
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        for dir in [cwd.clone(), cwd.join("bin")] {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }

    dirs
}

fn path_dirs() -> Vec<PathBuf> {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).collect())
        .unwrap_or_default()
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    if binary.to_ascii_lowercase().ends_with(".exe") {
        return vec![binary.to_string()];
    }
    vec![format!("{binary}.exe"), binary.to_string()]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Locate `binary` next to the executable, in the working directory, or on `PATH`.
pub fn locate_binary(binary: &str) -> Option<PathBuf> {
    let as_path = Path::new(binary);
    if as_path.components().count() > 1 {
        return as_path.is_file().then(|| as_path.to_path_buf());
    }
    find_binary_in_dirs(binary, &candidate_bin_dirs())
        .or_else(|| find_binary_in_dirs(binary, &path_dirs()))
}

/// Build an async command for `binary`, preferring a bundled copy.
pub fn command_for(binary: &str) -> Command {
    if Path::new(binary).components().count() == 1 {
        if let Some(path) = find_binary_in_dirs(binary, &candidate_bin_dirs()) {
            return Command::new(path);
        }
    }
    Command::new(binary)
}
