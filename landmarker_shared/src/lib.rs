use std::{
    env,
    path::{Path, PathBuf},
};

pub use byteorder;
pub use chrono;
pub use indoc;
pub use log;
pub use nalgebra;
pub use num_cpus;
pub use parking_lot;
pub use pathdiff;
pub use rayon;
pub use serde_json;
pub use serde_yaml;
pub use thiserror;
pub use walkdir;

/// Replaces a leading `~` with the home directory of the current user and makes the path absolute
/// relative to the working directory.
///
/// # Example
///
/// ```rust
/// use landmarker_shared::absolute_path;
/// let path = absolute_path("/tmp/assets");
/// assert_eq!(path, std::path::PathBuf::from("/tmp/assets"));
/// ```
pub fn absolute_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => match home_dir() {
            Some(home) => home.join(rest),
            None => path.to_owned(),
        },
        Err(_) => path.to_owned(),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        env::current_dir().map(|cwd| cwd.join(&expanded)).unwrap_or(expanded)
    }
}

/// Home directory of the current user taken from the environment.
pub fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_is_joined_with_cwd() {
        let path = absolute_path("some/dir");
        assert!(path.is_absolute());
        assert!(path.ends_with("some/dir"));
    }

    #[test]
    fn tilde_is_expanded() {
        let Some(home) = home_dir() else {
            return;
        };
        assert_eq!(absolute_path("~/.lmiotemplates"), home.join(".lmiotemplates"));
    }
}
