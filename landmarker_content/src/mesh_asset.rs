use std::path::{Path, PathBuf};

use gltf::{image::Format, mesh::Mode as PrimitiveMode};
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use landmarker_shared::{
    log::{trace, warn},
    nalgebra::Vector3,
};

use crate::{
    cache_builder::AssetBuilder,
    common::{extract_extension_from_path, CacheFile},
    image_asset::{self, ImageAsset},
    mesh_file::{self, MeshBlob},
    Error, Result,
};

/// Indexed triangle mesh as it is imported from the source file.
#[derive(Debug, Clone, Default)]
pub struct TriMesh {
    pub points: Vec<Vector3<f32>>,
    pub trilist: Vec<[u32; 3]>,
    /// One texture coordinate per point.
    pub tcoords: Option<Vec<[f32; 2]>>,
    pub texture: Option<ImageAsset>,
}

impl TriMesh {
    /// Imports an OBJ, glTF or GLB file. The format is chosen by the file extension.
    pub fn import(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mesh = match extract_extension_from_path(path)?.as_str() {
            "obj" => import_obj(path)?,
            "gltf" | "glb" => import_gltf(path)?,
            other => {
                return Err(Error::DecodeFailure {
                    path: path.to_owned(),
                    message: format!("Unsupported mesh format '{other}'"),
                })
            }
        };
        trace!(
            "Imported mesh '{}' with {} points and {} triangles (textured: {})",
            path.display(),
            mesh.points.len(),
            mesh.trilist.len(),
            mesh.is_textured()
        );
        Ok(mesh)
    }

    /// A mesh is only treated as textured when it has both a texture and texture coordinates.
    pub fn is_textured(&self) -> bool {
        self.texture.is_some() && self.tcoords.is_some()
    }

    /// Expands the indexed mesh to one record per triangle corner.
    pub fn to_blob(&self) -> Result<MeshBlob> {
        let n_points = self.points.len();
        let tcoords = self.tcoords.as_ref().filter(|_| self.is_textured());

        let mut positions = Vec::with_capacity(self.trilist.len() * 3);
        let mut corner_tcoords = tcoords.map(|_| Vec::with_capacity(self.trilist.len() * 3));
        for triangle in &self.trilist {
            for &index in triangle {
                let index = index as usize;
                let point = self.points.get(index).ok_or_else(|| Error::DecodeFailure {
                    path: PathBuf::new(),
                    message: format!("Triangle references point {index} but the mesh only has {n_points} points"),
                })?;
                positions.push([point.x, point.y, point.z]);
                if let (Some(tcoords), Some(corner_tcoords)) = (tcoords, corner_tcoords.as_mut()) {
                    corner_tcoords.push(tcoords.get(index).copied().unwrap_or_default());
                }
            }
        }
        Ok(MeshBlob {
            positions,
            normals: None,
            tcoords: corner_tcoords,
        })
    }
}

/// Writes the texture files (when textured) and `mesh.raw.gz` into the cache entry of the builder.
pub fn cache_mesh(asset_builder: &mut AssetBuilder, mesh: &TriMesh) -> Result<()> {
    if let Some(texture) = mesh.texture.as_ref().filter(|_| mesh.is_textured()) {
        trace!("Caching the texture of {}", asset_builder.asset_id());
        image_asset::cache_image(asset_builder, texture)?;
    }

    let blob = mesh.to_blob()?;
    let tmp_path = asset_builder.cache_entry_path().join(CacheFile::MESH_TMP);
    let path = asset_builder.cache_entry_path().join(CacheFile::MESH);
    mesh_file::write_compressed(&blob, tmp_path, &path).map_err(|err| Error::EncodeFailure {
        path: path.clone(),
        message: err.to_string(),
    })?;
    asset_builder.with_file(CacheFile::MESH);
    Ok(())
}

fn import_obj(path: &Path) -> Result<TriMesh> {
    let decode_failure = |message: String| Error::DecodeFailure {
        path: path.to_owned(),
        message,
    };
    let load_options = tobj::LoadOptions {
        single_index: true,
        triangulate: true,
        ignore_points: true,
        ignore_lines: true,
        ..Default::default()
    };
    let (models, materials) = tobj::load_obj(path, &load_options).map_err(|err| decode_failure(err.to_string()))?;

    let mut mesh = TriMesh::default();
    let mut tcoords = Some(Vec::new());
    let mut material_id = None;
    for model in &models {
        let offset = mesh.points.len() as u32;
        let n_points = model.mesh.positions.len() / 3;
        mesh.points.extend(
            model
                .mesh
                .positions
                .chunks_exact(3)
                .map(|position| Vector3::new(position[0], position[1], position[2])),
        );
        mesh.trilist.extend(
            model
                .mesh
                .indices
                .chunks_exact(3)
                .map(|triangle| [triangle[0] + offset, triangle[1] + offset, triangle[2] + offset]),
        );

        // Texture coordinates are only kept when every model has them.
        if model.mesh.texcoords.len() == n_points * 2 {
            if let Some(tcoords) = tcoords.as_mut() {
                tcoords.extend(model.mesh.texcoords.chunks_exact(2).map(|tcoord| [tcoord[0], tcoord[1]]));
            }
        } else {
            tcoords = None;
        }
        material_id = material_id.or(model.mesh.material_id);
    }
    mesh.tcoords = tcoords.filter(|tcoords| !tcoords.is_empty());

    let materials = match materials {
        Ok(materials) => materials,
        Err(err) => {
            warn!("Failed to load the materials of '{}': {err}", path.display());
            Vec::new()
        }
    };
    let texture_name = material_id
        .and_then(|material_id| materials.get(material_id))
        .or_else(|| materials.first())
        .and_then(|material| material.diffuse_texture.clone());
    if let Some(texture_name) = texture_name {
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        mesh.texture = Some(ImageAsset::import(directory.join(texture_name))?);
    }
    Ok(mesh)
}

fn import_gltf(path: &Path) -> Result<TriMesh> {
    let decode_failure = |message: String| Error::DecodeFailure {
        path: path.to_owned(),
        message,
    };
    let (document, buffers, images) = gltf::import(path).map_err(|err| decode_failure(err.to_string()))?;

    let mut mesh = TriMesh::default();
    let mut tcoords = Some(Vec::new());
    let mut image_index = None;
    for gltf_mesh in document.meshes() {
        for primitive in gltf_mesh.primitives() {
            if primitive.mode() != PrimitiveMode::Triangles {
                warn!("Skipping primitive with mode {:?} in '{}'", primitive.mode(), path.display());
                continue;
            }
            let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &data.0[..]));
            let positions = reader
                .read_positions()
                .ok_or_else(|| decode_failure("Primitive has no vertex positions".to_owned()))?
                .collect::<Vec<_>>();

            let offset = mesh.points.len() as u32;
            let n_points = positions.len() as u32;
            mesh.points.extend(positions.iter().map(|position| Vector3::from(*position)));
            let indices = match reader.read_indices() {
                Some(indices) => indices.into_u32().collect::<Vec<_>>(),
                None => (0..n_points).collect(),
            };
            mesh.trilist.extend(
                indices
                    .chunks_exact(3)
                    .map(|triangle| [triangle[0] + offset, triangle[1] + offset, triangle[2] + offset]),
            );

            match (reader.read_tex_coords(0), tcoords.as_mut()) {
                (Some(primitive_tcoords), Some(tcoords)) => tcoords.extend(primitive_tcoords.into_f32()),
                _ => tcoords = None,
            }

            image_index = image_index.or_else(|| {
                primitive
                    .material()
                    .pbr_metallic_roughness()
                    .base_color_texture()
                    .map(|info| info.texture().source().index())
            });
        }
    }
    mesh.tcoords = tcoords.filter(|tcoords| !tcoords.is_empty());

    if let Some(image) = image_index.and_then(|index| images.get(index)) {
        let name = format!("{}#image{}", path.display(), image_index.unwrap_or_default());
        mesh.texture = texture_from_gltf(image).map(|texture| ImageAsset::from_image(name, texture));
        if mesh.texture.is_none() {
            warn!("Unsupported texture format {:?} in '{}'", image.format, path.display());
        }
    }
    Ok(mesh)
}

fn texture_from_gltf(image: &gltf::image::Data) -> Option<DynamicImage> {
    let pixels = image.pixels.clone();
    match image.format {
        Format::R8 => GrayImage::from_raw(image.width, image.height, pixels).map(DynamicImage::ImageLuma8),
        Format::R8G8B8 => RgbImage::from_raw(image.width, image.height, pixels).map(DynamicImage::ImageRgb8),
        Format::R8G8B8A8 => RgbaImage::from_raw(image.width, image.height, pixels).map(DynamicImage::ImageRgba8),
        _ => None,
    }
}
