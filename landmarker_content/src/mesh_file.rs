//! Meshes are written to the cache in a flat binary format that the browser client can upload to
//! the GPU without any further processing.
//!
//! ## Overview
//!
//! The file starts with a fixed header of four little-endian `u32` values followed by flat `f32`
//! arrays. The vertex data is not indexed: every corner of every triangle has its own record.
//!
//! Header:
//!
//! | Field       | Type | Size (bytes) | Description                              |
//! |-------------|------|--------------|------------------------------------------|
//! | n_triangles | u32  | 4            | Number of triangles                      |
//! | is_textured | u32  | 4            | 1 when texture coordinates follow        |
//! | has_normals | u32  | 4            | 1 when normals follow (currently never)  |
//! | reserved    | u32  | 4            | Always 0                                 |
//!
//! Content:
//!
//! | Field     | Type      | Count               | Present when  |
//! |-----------|-----------|---------------------|---------------|
//! | positions | f32[3]    | `n_triangles * 3`   | always        |
//! | normals   | f32[3]    | `n_triangles * 3`   | `has_normals` |
//! | tcoords   | f32[2]    | `n_triangles * 3`   | `is_textured` |
//!
//! The file itself has no version field. It is stored gzip-compressed as `mesh.raw.gz` and the
//! version of the cache layout is recorded in the completion marker of the cache entry.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use landmarker_shared::byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub const MESH_HEADER_SIZE: usize = 16;

/// Compression level of the gzip stream. Favors speed because the client decompresses anyway.
pub const MESH_COMPRESSION_LEVEL: u32 = 1;

/// Header that is written at the beginning of a mesh file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshHeader {
    pub n_triangles: u32,
    pub is_textured: bool,
    pub has_normals: bool,
    pub reserved: u32,
}

impl MeshHeader {
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let n_triangles = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Failed to read number of triangles"))?;
        let is_textured = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Failed to read texture flag"))?;
        let has_normals = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Failed to read normals flag"))?;
        let reserved = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Failed to read reserved field"))?;
        Ok(Self {
            n_triangles,
            is_textured: is_textured != 0,
            has_normals: has_normals != 0,
            reserved,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.n_triangles)?;
        writer.write_u32::<LittleEndian>(self.is_textured as u32)?;
        writer.write_u32::<LittleEndian>(self.has_normals as u32)?;
        writer.write_u32::<LittleEndian>(self.reserved)?;
        Ok(())
    }
}

/// Mesh data expanded per triangle corner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshBlob {
    pub positions: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub tcoords: Option<Vec<[f32; 2]>>,
}

impl MeshBlob {
    pub fn n_triangles(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn header(&self) -> MeshHeader {
        MeshHeader {
            n_triangles: self.n_triangles() as u32,
            is_textured: self.tcoords.is_some(),
            has_normals: self.normals.is_some(),
            reserved: 0,
        }
    }

    /// Checks that all arrays have one record per triangle corner.
    pub fn check(&self) -> io::Result<()> {
        if self.positions.len() % 3 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Number of positions is not a multiple of 3",
            ));
        }
        if u32::try_from(self.n_triangles()).is_err() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "Too many triangles"));
        }
        if self.normals.as_ref().is_some_and(|normals| normals.len() != self.positions.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Number of normals doesn't match the number of positions",
            ));
        }
        if self.tcoords.as_ref().is_some_and(|tcoords| tcoords.len() != self.positions.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Number of texture coordinates doesn't match the number of positions",
            ));
        }
        Ok(())
    }

    /// Writes the header and the content.
    ///
    /// # Example
    ///
    /// ```rust
    /// use landmarker_content::mesh_file::{MeshBlob, MESH_HEADER_SIZE};
    ///
    /// let blob = MeshBlob {
    ///     positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
    ///     normals: None,
    ///     tcoords: None,
    /// };
    /// let mut buf = Vec::new();
    /// blob.write(&mut buf).unwrap();
    /// assert_eq!(buf.len(), MESH_HEADER_SIZE + 3 * 3 * 4);
    /// ```
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.check()?;
        self.header().write(&mut writer)?;
        for position in &self.positions {
            write_f32s(&mut writer, position)?;
        }
        if let Some(normals) = &self.normals {
            for normal in normals {
                write_f32s(&mut writer, normal)?;
            }
        }
        if let Some(tcoords) = &self.tcoords {
            for tcoord in tcoords {
                write_f32s(&mut writer, tcoord)?;
            }
        }
        Ok(())
    }

    /// Reads the header and the content.
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let header = MeshHeader::read(&mut reader)?;
        let n_corners = header.n_triangles as usize * 3;
        let positions = read_records::<_, 3>(&mut reader, n_corners)?;
        let normals = if header.has_normals {
            Some(read_records::<_, 3>(&mut reader, n_corners)?)
        } else {
            None
        };
        let tcoords = if header.is_textured {
            Some(read_records::<_, 2>(&mut reader, n_corners)?)
        } else {
            None
        };
        Ok(Self {
            positions,
            normals,
            tcoords,
        })
    }
}

fn write_f32s<W: Write>(writer: &mut W, values: &[f32]) -> io::Result<()> {
    for value in values {
        writer.write_f32::<LittleEndian>(*value)?;
    }
    Ok(())
}

fn read_records<R: Read, const N: usize>(reader: &mut R, count: usize) -> io::Result<Vec<[f32; N]>> {
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let mut record = [0.0; N];
        reader
            .read_f32_into::<LittleEndian>(&mut record)
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "Mesh content is truncated"))?;
        records.push(record);
    }
    Ok(records)
}

/// Writes the blob uncompressed to `tmp_path`, compresses it into `path` and removes `tmp_path`.
pub fn write_compressed(blob: &MeshBlob, tmp_path: impl AsRef<Path>, path: impl AsRef<Path>) -> io::Result<()> {
    let tmp_path = tmp_path.as_ref();
    let mut writer = BufWriter::new(File::create(tmp_path)?);
    blob.write(&mut writer)?;
    writer.flush()?;
    drop(writer);

    let mut reader = BufReader::new(File::open(tmp_path)?);
    let mut encoder = GzEncoder::new(
        BufWriter::new(File::create(path.as_ref())?),
        Compression::new(MESH_COMPRESSION_LEVEL),
    );
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.flush()?;
    drop(reader);

    fs::remove_file(tmp_path)
}

/// Reads a gzip-compressed mesh file.
pub fn read_compressed(path: impl AsRef<Path>) -> io::Result<MeshBlob> {
    let file = File::open(path)?;
    MeshBlob::read(BufReader::new(GzDecoder::new(file)))
}
