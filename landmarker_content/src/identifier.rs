use std::path::{Component, Path, PathBuf};

use landmarker_shared::pathdiff;

use crate::{
    common::{extract_file_stem_from_path, AssetId},
    Error, Result,
};

/// Joins the components of a relative path when [`IdentifierStrategy::RelativePath`] is used.
pub const PATH_SEPARATOR_TOKEN: &str = "__";

/// Determines how the [`AssetId`] of a file is derived from its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierStrategy {
    /// The file name without its extension. Only suitable for flat asset directories.
    FileName,
    /// The path relative to `root` with all components joined by [`PATH_SEPARATOR_TOKEN`].
    RelativePath { root: PathBuf },
}

impl IdentifierStrategy {
    /// Derives the [`AssetId`] for the given path.
    ///
    /// # Example
    ///
    /// ```rust
    /// use landmarker_content::{AssetId, IdentifierStrategy};
    ///
    /// let by_name = IdentifierStrategy::FileName;
    /// assert_eq!(by_name.identifier("/data/faces/face01.jpg").unwrap(), AssetId::new("face01"));
    ///
    /// let by_path = IdentifierStrategy::RelativePath { root: "/data".into() };
    /// assert_eq!(by_path.identifier("/data/faces/face01.jpg").unwrap(), AssetId::new("faces__face01.jpg"));
    /// ```
    pub fn identifier(&self, path: impl AsRef<Path>) -> Result<AssetId> {
        let path = path.as_ref();
        match self {
            IdentifierStrategy::FileName => extract_file_stem_from_path(path).map(AssetId::new),
            IdentifierStrategy::RelativePath { root } => {
                let relative = pathdiff::diff_paths(path, root).ok_or_else(|| Error::InvalidPath(path.to_owned()))?;
                let mut parts = Vec::new();
                for component in relative.components() {
                    match component {
                        Component::Normal(part) => {
                            let part = part.to_str().ok_or_else(|| Error::InvalidPath(path.to_owned()))?;
                            parts.push(part);
                        }
                        Component::CurDir => {}
                        _ => return Err(Error::InvalidPath(path.to_owned())),
                    }
                }
                if parts.is_empty() {
                    return Err(Error::InvalidPath(path.to_owned()));
                }
                Ok(AssetId::new(parts.join(PATH_SEPARATOR_TOKEN)))
            }
        }
    }
}
