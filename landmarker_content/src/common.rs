use std::{
    borrow::Borrow,
    fmt::{self, Formatter},
    io,
    path::{Path, PathBuf},
    result,
    str::FromStr,
};

use landmarker_shared::thiserror;
use serde::{Deserialize, Serialize};

/// Completion marker of a cache entry. It is written after all other files of the entry.
pub const ASSET_META_FILE_NAME: &str = "asset.yaml";

/// Version of the cache entry layout that is written into the completion marker.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Names of the files inside of a cache entry.
pub struct CacheFile;

impl CacheFile {
    pub const IMAGE_INFO: &'static str = "image.json";
    pub const TEXTURE: &'static str = "texture.jpg";
    pub const THUMBNAIL: &'static str = "thumbnail.jpg";
    pub const MESH_TMP: &'static str = "mesh.raw.tmp";
    pub const MESH: &'static str = "mesh.raw.gz";
}

pub const LANDMARK_EXTENSION: &str = "ljson";
pub const TEMPLATE_EXTENSION: &str = "yml";
pub const LEGACY_TEMPLATE_EXTENSION: &str = "txt";
pub const COLLECTION_EXTENSION: &str = "txt";

/// Reserved collection that contains every asset in the cache.
pub const ALL_COLLECTION_ID: &str = "all";

pub const CACHE_DIR_NAME: &str = "lmiocache";
pub const LANDMARK_DIR_NAME: &str = "lmiolandmarks";
pub const TEMPLATE_DIR_NAME: &str = ".lmiotemplates";

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid path: {0}")]
    InvalidPath(PathBuf),
    #[error("Asset id '{asset_id}' is not unique - links to {first} and {second}")]
    DuplicateAssetIdentifier {
        asset_id: AssetId,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Failed to decode '{path}': {message}")]
    DecodeFailure { path: PathBuf, message: String },
    #[error("Failed to encode '{path}': {message}")]
    EncodeFailure { path: PathBuf, message: String },
    #[error("Unable to save landmarks {asset_id}:{landmark_id}: {message}")]
    SaveConflict {
        asset_id: String,
        landmark_id: String,
        message: String,
    },
    #[error("Invalid template '{template_id}': {message}")]
    InvalidTemplate { template_id: String, message: String },
    #[error("Unexpected mode - found '{0}' but must be 'image' or 'mesh'")]
    UnexpectedMode(String),
    #[error("IoError: {0}")]
    IoError(#[from] io::Error),
    #[error("Failed to start thread pool")]
    FailedToStartThreadPool,
    #[error("Other: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Returns `true` when the error means that the requested item doesn't exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Identifies an asset. Unique within one asset directory and used as directory name in the cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    /// Create a new [`AssetId`]. No validation is done.
    ///
    /// # Example
    ///
    /// ```rust
    /// use landmarker_content::AssetId;
    /// let asset_id = AssetId::new("face01");
    /// assert_eq!(asset_id.as_str(), "face01");
    /// ```
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns whether the id can be joined to a directory without escaping it.
    ///
    /// # Example
    ///
    /// ```rust
    /// use landmarker_content::AssetId;
    /// assert!(AssetId::new("faces__face01.jpg").is_safe());
    /// assert!(!AssetId::new("../etc").is_safe());
    /// ```
    pub fn is_safe(&self) -> bool {
        is_safe_name(&self.0)
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AssetId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&AssetId> for AssetId {
    fn from(value: &AssetId) -> Self {
        value.clone()
    }
}

impl Borrow<str> for AssetId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Determines whether the server works with 2D images or 3D meshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Image,
    Mesh,
}

impl Mode {
    /// Number of dimensions of a landmark point in this mode.
    pub fn n_dims(&self) -> usize {
        match self {
            Mode::Image => 2,
            Mode::Mesh => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Image => "image",
            Mode::Mesh => "mesh",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(Mode::Image),
            "mesh" => Ok(Mode::Mesh),
            other => Err(Error::UnexpectedMode(other.to_owned())),
        }
    }
}

/// A name that is used as a single path component.
pub(crate) fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\']) && !name.contains('\0')
}

/// Joins `name` to `root` and fails with [`Error::NotFound`] when the name would escape `root`.
pub(crate) fn safe_join(root: &Path, name: &str) -> Result<PathBuf> {
    if !is_safe_name(name) {
        return Err(Error::NotFound(name.to_owned()));
    }
    Ok(root.join(name))
}

pub(crate) fn extract_extension_from_path(path: &Path) -> Result<String> {
    Ok(path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.to_lowercase())
        .ok_or(Error::InvalidPath(path.to_owned()))?
        .to_owned())
}

pub(crate) fn extract_file_stem_from_path(path: &Path) -> Result<String> {
    Ok(path
        .file_stem()
        .and_then(|file_stem| file_stem.to_str())
        .ok_or(Error::InvalidPath(path.to_owned()))?
        .to_owned())
}
