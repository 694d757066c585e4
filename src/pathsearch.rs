//! Target-OS executable search path (§4.E).
//!
//! `PATH` is split on `;` (the target OS's separator, not the host's); each
//! element is tried as `element\program_name` and, failing that, with a
//! `.exe` suffix appended. The caller is expected to skip the search
//! entirely when `program_name` already contains a directory separator or
//! resolves relative to the current directory; see
//! [`needs_path_search`].
use std::path::{Path, PathBuf};

/// True if `program` should go through [`search`] at all: it contains no
/// `\` and doesn't already resolve as a file relative to the current
/// directory.
pub fn needs_path_search(program: &str) -> bool {
    if program.contains('\\') {
        return false;
    }
    !Path::new(program).is_file()
}

/// Searches `path_var` (the raw value of `PATH`, `;`-separated) for
/// `program`, trying the bare name first and then `program.exe` in each
/// directory, in order.
pub fn search(path_var: &str, program: &str) -> Option<PathBuf> {
    for dir in path_var.split(';') {
        if dir.is_empty() {
            continue;
        }
        let candidate = format!("{dir}\\{program}");
        if Path::new(&candidate).is_file() {
            return Some(PathBuf::from(candidate));
        }
        let with_exe = format!("{candidate}.exe");
        if Path::new(&with_exe).is_file() {
            return Some(PathBuf::from(with_exe));
        }
    }
    None
}

/// Resolves `program` to the path that should actually be executed: the
/// verbatim program name if no search is needed or the search turns up
/// nothing, or the first match `search` finds in `PATH`.
pub fn resolve(program: &str) -> PathBuf {
    if !needs_path_search(program) {
        return PathBuf::from(program);
    }
    let path_var = std::env::var("PATH").unwrap_or_default();
    search(&path_var, program).unwrap_or_else(|| PathBuf::from(program))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn program_with_separator_skips_search() {
        assert!(!needs_path_search("bin\\echo.exe"));
    }

    #[test]
    fn program_resolving_locally_skips_search() {
        // "Cargo.toml" exists relative to the crate root, which is the
        // process's current directory under `cargo test`.
        assert!(!needs_path_search("Cargo.toml"));
    }

    #[test]
    fn search_finds_bare_name_then_exe_suffixed() {
        let dir = tempdir();
        let exe = dir.join("tool.exe");
        File::create(&exe).unwrap();
        let path_var = dir.to_str().unwrap().to_string();
        let found = search(&path_var, "tool").unwrap();
        assert_eq!(found, exe);
    }

    #[test]
    fn search_tries_each_element_in_order() {
        let dir1 = tempdir();
        let dir2 = tempdir();
        File::create(dir2.join("only_in_two.exe")).unwrap();
        let path_var = format!("{};{}", dir1.to_str().unwrap(), dir2.to_str().unwrap());
        let found = search(&path_var, "only_in_two").unwrap();
        assert_eq!(found, dir2.join("only_in_two.exe"));
    }

    #[test]
    fn search_returns_none_when_not_found() {
        let dir = tempdir();
        let path_var = dir.to_str().unwrap().to_string();
        assert_eq!(search(&path_var, "nosuch"), None);
    }

    #[test]
    fn search_skips_empty_path_elements() {
        let dir = tempdir();
        File::create(dir.join("tool.exe")).unwrap();
        let path_var = format!(";;{}", dir.to_str().unwrap());
        assert!(search(&path_var, "tool").is_some());
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("ice9-pathsearch-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
