use std::{
    fs,
    path::{Path, PathBuf},
    sync::Once,
};

use image::{DynamicImage, ImageError, ImageFormat, Rgb, RgbImage};
use landmarker_shared::log::LevelFilter;

static LOGGER: Once = Once::new();

/// Installs a logger for the tests. Can be called from every test; only the first call has an effect.
pub fn setup_logger() {
    LOGGER.call_once(|| {
        simple_logger::SimpleLogger::new()
            .with_level(LevelFilter::Trace)
            .init()
            .expect("Failed to install the test logger");
    });
}

/// Creates an RGB gradient image with the given size.
pub fn gradient_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let r = (255 * x / width.max(1)) as u8;
        let g = (255 * y / height.max(1)) as u8;
        Rgb([r, g, 128])
    })
}

/// Writes a gradient image in the given format and returns the path.
pub fn write_image(path: impl AsRef<Path>, width: u32, height: u32, format: ImageFormat) -> PathBuf {
    let path = path.as_ref().to_owned();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create the directory for the test image");
    }
    DynamicImage::ImageRgb8(gradient_image(width, height))
        .save_with_format(&path, format)
        .unwrap_or_else(|err| panic!("Failed to save test image to \"{}\": {err}", path.display()));
    path
}

/// Opens the given image and expects the path to be correct.
pub fn open_image(path: impl AsRef<Path>) -> DynamicImage {
    let f = |err: ImageError| {
        let path_str = path.as_ref().to_string_lossy().into_owned();
        panic!("Could not open test image at path \"{path_str}\" due to the following error: {err}")
    };
    image::open(&path).unwrap_or_else(f)
}

/// Positions of the two triangles that make up the quad written by [`write_quad_obj`] in the order in
/// which they appear in the OBJ file.
pub const QUAD_TRIANGLES: [[[f32; 3]; 3]; 2] = [
    [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0]],
    [[0.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
];

/// Texture coordinates that belong to the corners of [`QUAD_TRIANGLES`].
pub const QUAD_TCOORDS: [[[f32; 2]; 3]; 2] = [
    [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]],
    [[0.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
];

/// Writes a unit quad consisting of two triangles as OBJ file. When `textured` is set, a material
/// library and a PNG texture are written next to the OBJ file.
pub fn write_quad_obj(path: impl AsRef<Path>, textured: bool) -> PathBuf {
    let path = path.as_ref().to_owned();
    let directory = path.parent().expect("OBJ path has no parent").to_owned();
    fs::create_dir_all(&directory).expect("Failed to create the directory for the OBJ file");
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .expect("OBJ path has no file stem")
        .to_owned();

    let mut obj = String::new();
    if textured {
        let mtl_name = format!("{stem}.mtl");
        let texture_name = format!("{stem}_texture.png");
        write_image(directory.join(&texture_name), 8, 8, ImageFormat::Png);
        fs::write(directory.join(&mtl_name), format!("newmtl quad\nKd 1 1 1\nmap_Kd {texture_name}\n"))
            .expect("Failed to write the MTL file");
        obj.push_str(&format!("mtllib {mtl_name}\n"));
    }
    obj.push_str("v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\n");
    if textured {
        obj.push_str("vt 0 0\nvt 1 0\nvt 1 1\nvt 0 1\nusemtl quad\n");
        obj.push_str("f 1/1 2/2 3/3\nf 1/1 3/3 4/4\n");
    } else {
        obj.push_str("f 1 2 3\nf 1 3 4\n");
    }
    fs::write(&path, obj).expect("Failed to write the OBJ file");
    path
}

/// Asserts that two slices of floats are equal within f32 precision.
pub fn assert_f32_slice_eq(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "slices have different lengths");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= f32::EPSILON, "value at index {index} differs: {a} != {e}");
    }
}
