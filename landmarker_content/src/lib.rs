//! # Overview
//!
//! Crate for [indexing](asset_paths), [caching](cache_builder) and [serving](cache_reader) the
//! assets of a landmarker server together with their [landmarks](landmark),
//! [templates](template) and [collections](collection).
//!
//! This crate is based around the idea of two directories. One is the asset directory, which
//! contains the original images or meshes in any supported format, and the other is the cache
//! directory, which contains the assets in the formats that the browser client understands. For
//! every asset there is a *directory* in the cache that is named after its [`AssetId`]. Inside of
//! it are the cached files and an `asset.yaml` file that is written last and marks the entry as
//! complete.
//!
//! ## Example:
//!
//! **Asset Directory:**
//!
//! ```text
//! assets/
//! ├─ face01.jpg
//! ├─ face02.png
//! ├─ head.obj
//! ├─ head.mtl
//! ├─ head_texture.png
//! ```
//!
//! **Cache Directory:**
//!
//! ```text
//! lmiocache/
//! ├─ face01/
//! │  ├─ image.json
//! │  ├─ texture.jpg
//! │  ├─ thumbnail.jpg
//! │  ├─ asset.yaml
//! ├─ face02/
//! │  ├─ ...
//! ├─ head/
//! │  ├─ image.json
//! │  ├─ texture.jpg
//! │  ├─ thumbnail.jpg
//! │  ├─ mesh.raw.gz
//! │  ├─ asset.yaml
//! ```
//!
//! # Components
//!
//! The [`IdentifierStrategy`] and [`asset_paths::index`] map the files of the asset directory
//! to [`AssetId`]s. [`cache_builder::materialize`] fills the cache for every asset that has no
//! complete entry yet and the [`cache_reader`] serves the cached files by id.

pub mod asset_paths;
pub mod cache_builder;
pub mod cache_reader;
pub mod collection;
mod common;
mod identifier;
pub mod image_asset;
pub mod landmark;
pub mod mesh_asset;
pub mod mesh_file;
pub mod template;

pub use common::*;
pub use identifier::*;
