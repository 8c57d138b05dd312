use std::{
    fs::{self, File},
    io::{BufWriter, Cursor, Write},
    path::{Path, PathBuf},
};

use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, io::Reader as ImageReader, ColorType, DynamicImage, ImageFormat};
use landmarker_shared::{
    log::{trace, warn},
    serde_json,
};
use serde::{Deserialize, Serialize};

use crate::{cache_builder::AssetBuilder, common::CacheFile, Error, Result};

/// Larger textures can't be rendered by some WebGL implementations.
pub const MAX_TEXTURE_DIMENSION: u32 = 4096;
pub const TEXTURE_QUALITY: u8 = 75;
pub const THUMBNAIL_WIDTH: u32 = 640;
pub const THUMBNAIL_QUALITY: u8 = 20;

/// Content of the `image.json` file of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
}

/// Encoded JPEG data that can be written to the cache without re-encoding.
#[derive(Debug, Clone)]
enum OriginalJpeg {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// A decoded image together with its original encoding when that was JPEG.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    name: String,
    image: DynamicImage,
    original_jpeg: Option<OriginalJpeg>,
}

impl ImageAsset {
    /// Decodes the image file at `path`. The format is determined from the content.
    pub fn import(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let decode_failure = |message: String| Error::DecodeFailure {
            path: path.to_owned(),
            message,
        };
        let reader = ImageReader::open(path)?
            .with_guessed_format()
            .map_err(|err| decode_failure(err.to_string()))?;
        let format = reader.format();
        let image = reader.decode().map_err(|err| decode_failure(err.to_string()))?;
        trace!("Decoded image '{}' ({format:?}, {}x{})", path.display(), image.width(), image.height());
        Ok(Self {
            name: path.display().to_string(),
            image,
            original_jpeg: (format == Some(ImageFormat::Jpeg)).then(|| OriginalJpeg::File(path.to_owned())),
        })
    }

    /// Decodes an image from memory. `name` is only used for messages.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Result<Self> {
        let name = name.into();
        let decode_failure = |message: String| Error::DecodeFailure {
            path: PathBuf::from(&name),
            message,
        };
        let reader = ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .map_err(|err| decode_failure(err.to_string()))?;
        let format = reader.format();
        let image = reader.decode().map_err(|err| decode_failure(err.to_string()))?;
        let original_jpeg = (format == Some(ImageFormat::Jpeg)).then(|| OriginalJpeg::Bytes(bytes));
        Ok(Self {
            name,
            image,
            original_jpeg,
        })
    }

    /// Wraps an image that has no original encoding, e.g. a texture embedded in a mesh file.
    pub fn from_image(name: impl Into<String>, image: DynamicImage) -> Self {
        Self {
            name: name.into(),
            image,
            original_jpeg: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn info(&self) -> ImageInfo {
        ImageInfo {
            width: self.image.width(),
            height: self.image.height(),
        }
    }

    fn exceeds_texture_limit(&self) -> bool {
        self.image.width() > MAX_TEXTURE_DIMENSION || self.image.height() > MAX_TEXTURE_DIMENSION
    }
}

/// Writes `image.json`, `texture.jpg` and `thumbnail.jpg` into the cache entry of the builder.
pub fn cache_image(asset_builder: &mut AssetBuilder, image: &ImageAsset) -> Result<()> {
    let asset_id = asset_builder.asset_id().clone();
    if image.exceeds_texture_limit() {
        warn!(
            "{asset_id} has shape {}x{}. Dims larger than {MAX_TEXTURE_DIMENSION} may have issues rendering in older browsers.",
            image.image.width(),
            image.image.height()
        );
    }

    // 1. Image metadata
    let image_info_path = asset_builder.cache_entry_path().join(CacheFile::IMAGE_INFO);
    let image_info = serde_json::to_vec(&image.info()).map_err(|err| Error::Other(Box::new(err)))?;
    fs::write(&image_info_path, image_info)?;
    asset_builder.with_file(CacheFile::IMAGE_INFO);

    // 2. Texture
    let texture_path = asset_builder.cache_entry_path().join(CacheFile::TEXTURE);
    match (&image.original_jpeg, image.exceeds_texture_limit()) {
        (Some(OriginalJpeg::File(original_path)), false) => {
            trace!("Copying original JPEG '{}' for {asset_id}", original_path.display());
            fs::copy(original_path, &texture_path)?;
        }
        (Some(OriginalJpeg::Bytes(bytes)), false) => {
            trace!("Writing original JPEG bytes for {asset_id}");
            fs::write(&texture_path, bytes)?;
        }
        _ => {
            trace!("Encoding texture for {asset_id}");
            write_jpeg(&image.image, &texture_path, TEXTURE_QUALITY)?;
        }
    }
    asset_builder.with_file(CacheFile::TEXTURE);

    // 3. Thumbnail
    let thumbnail_path = asset_builder.cache_entry_path().join(CacheFile::THUMBNAIL);
    write_jpeg(&thumbnail(&image.image, THUMBNAIL_WIDTH), &thumbnail_path, THUMBNAIL_QUALITY)?;
    asset_builder.with_file(CacheFile::THUMBNAIL);

    Ok(())
}

/// Resizes the image to the given width and keeps the aspect ratio.
pub fn thumbnail(image: &DynamicImage, width: u32) -> DynamicImage {
    let height_to_width = image.height() as f64 / image.width().max(1) as f64;
    let height = ((height_to_width * width as f64) as u32).max(1);
    image.resize_exact(width, height, FilterType::Triangle)
}

/// Encodes the image as JPEG with the given quality.
pub fn write_jpeg(image: &DynamicImage, path: &Path, quality: u8) -> Result<()> {
    let encode_failure = |message: String| Error::EncodeFailure {
        path: path.to_owned(),
        message,
    };
    let rgb = image.to_rgb8();
    let mut writer = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(&mut writer, quality)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|err| encode_failure(err.to_string()))?;
    writer.flush()?;
    Ok(())
}
