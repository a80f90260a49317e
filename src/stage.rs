//! Import staging.
//!
//! Turns fetched bytes into engine-importable artifacts under the asset
//! folder. Container assets get their embedded textures and materials
//! extracted into individually addressable files.

use std::{
    fs,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use hashbrown::HashMap;

use crate::address::ResolvedLocation;

/// Largest texture dimension kept as-is. Anything over is downsized
/// proportionally.
pub const TEXTURE_SIZE_CEILING: u32 = 512;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Failed to parse container '{path}': {error}")]
    GltfCritical { error: gltf::Error, path: PathBuf },

    #[error("No importer found for '{path}'")]
    ImporterNotFound { path: PathBuf },

    #[error("Material '{material}' texture slot '{slot}' cannot be resolved")]
    EmbedMaterial { material: String, slot: String },

    #[error("Failed to decode embedded texture '{name}' in '{path}'")]
    TextureDecode { name: String, path: PathBuf },

    #[error("Failed to encode texture '{path}': {error}")]
    Image {
        error: image::ImageError,
        path: PathBuf,
    },

    #[error("Failed to serialize material '{path}': {error}")]
    Material {
        error: serde_json::Error,
        path: PathBuf,
    },

    #[error("Failed to write '{path}': {error}")]
    Io {
        error: std::io::Error,
        path: PathBuf,
    },
}

/// Asset kinds the stager can import.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetKind {
    /// Scene/mesh graph with embedded resources.
    Container,
    Texture,
    RawBuffer,
}

impl AssetKind {
    /// Guesses the importer for a staged path from its extension.
    /// `None` means no importer hook exists for the path.
    pub fn guess(path: &str) -> Option<AssetKind> {
        let ext = path.rsplit('.').next()?;
        match ext.to_ascii_lowercase().as_str() {
            "glb" | "gltf" => Some(AssetKind::Container),
            "png" | "jpg" | "jpeg" | "tga" | "bmp" => Some(AssetKind::Texture),
            "bin" | "bytes" | "raw" | "buf" => Some(AssetKind::RawBuffer),
            _ => None,
        }
    }
}

/// Imported artifact plus its extracted sub-resources.
/// Owns no other artifact; siblings are referenced by location only.
#[derive(Debug)]
pub struct StagedArtifact {
    pub path: PathBuf,
    pub textures: Vec<PathBuf>,
    pub materials: Vec<PathBuf>,

    /// Logical names of external sources the container references.
    pub refs: Vec<String>,
}

/// Serialized form of an extracted material artifact.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct MaterialArtifact {
    pub name: String,
    pub shader: String,
    pub base_color_factor: [f32; 4],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub emissive_factor: [f32; 3],

    /// Slot name to texture artifact path, relative to the asset folder.
    /// BTreeMap keeps serialized output byte-stable.
    pub textures: std::collections::BTreeMap<String, String>,
}

pub struct Stager {
    shader: String,
    ceiling: u32,
    import_index: usize,
}

impl Stager {
    pub fn new(shader: impl Into<String>) -> Self {
        Stager {
            shader: shader.into(),
            ceiling: TEXTURE_SIZE_CEILING,
            import_index: 0,
        }
    }

    /// Number of import operations performed. Progress reporting only.
    pub fn imported(&self) -> usize {
        self.import_index
    }

    /// Stages fetched bytes at the resolved location.
    ///
    /// Texture and RawBuffer kinds are no-ops when the final path already
    /// exists: content is addressed by hash and trusted unchanged.
    /// Containers are always reprocessed because embedded-resource
    /// extraction is not cached.
    #[tracing::instrument(skip(self, blob), fields(len = blob.len()))]
    pub fn stage(
        &mut self,
        kind: AssetKind,
        blob: Vec<u8>,
        location: &ResolvedLocation,
    ) -> Result<StagedArtifact, StageError> {
        self.import_index += 1;

        match kind {
            AssetKind::Texture | AssetKind::RawBuffer => self.stage_bytes(blob, location),
            AssetKind::Container => self.stage_container(blob, location),
        }
    }

    fn stage_bytes(
        &mut self,
        blob: Vec<u8>,
        location: &ResolvedLocation,
    ) -> Result<StagedArtifact, StageError> {
        let path = location.final_path().to_owned();

        if path.exists() {
            tracing::debug!("'{}' already staged, re-importing as-is", path.display());
        } else {
            write_file(&path, &blob)?;
        }

        Ok(StagedArtifact {
            path,
            textures: Vec::new(),
            materials: Vec::new(),
            refs: Vec::new(),
        })
    }

    fn stage_container(
        &mut self,
        blob: Vec<u8>,
        location: &ResolvedLocation,
    ) -> Result<StagedArtifact, StageError> {
        let path = location.final_path().to_owned();

        let mut container =
            gltf::Gltf::from_slice(&blob).map_err(|error| StageError::GltfCritical {
                error,
                path: path.clone(),
            })?;
        let bin = container.blob.take();
        let doc = container.document;

        write_file(&path, &blob)?;
        drop(blob);

        let mut refs = Vec::new();

        // Embedded buffers resolve in place; external ones are siblings,
        // fetched and staged separately under their own hash.
        let mut buffers: Vec<Vec<u8>> = Vec::new();
        for buffer in doc.buffers() {
            match buffer.source() {
                gltf::buffer::Source::Bin => {
                    buffers.push(bin.clone().unwrap_or_default());
                }
                gltf::buffer::Source::Uri(uri) if uri.starts_with("data:") => {
                    buffers.push(data_uri_bytes(uri).unwrap_or_default());
                }
                gltf::buffer::Source::Uri(uri) => {
                    refs.push(uri.to_owned());
                    buffers.push(Vec::new());
                }
            }
        }

        let textures_dir = location.textures_dir();
        let mut written: HashMap<String, String> = HashMap::new();
        let mut texture_paths = Vec::new();
        let mut taken_names: HashMap<String, usize> = HashMap::new();

        for (index, img) in doc.images().enumerate() {
            let name = match img.name() {
                Some(name) if !name.is_empty() => unique_name(name, &mut taken_names),
                _ => format!("image_{}", index),
            };
            let out = textures_dir.join(format!("{}.png", name));

            let bytes = match img.source() {
                gltf::image::Source::View { view, .. } => buffers
                    .get(view.buffer().index())
                    .and_then(|buf| buf.get(view.offset()..view.offset() + view.length()))
                    .map(|slice| slice.to_vec()),
                gltf::image::Source::Uri { uri, .. } if uri.starts_with("data:") => {
                    data_uri_bytes(uri)
                }
                gltf::image::Source::Uri { uri, .. } => {
                    refs.push(uri.to_owned());
                    continue;
                }
            };

            let bytes = bytes.ok_or_else(|| StageError::TextureDecode {
                name: name.clone(),
                path: out.clone(),
            })?;

            // Readback path: decode whatever the pixel payload is and
            // re-encode as PNG.
            let decoded = image::load_from_memory(&bytes).map_err(|error| StageError::Image {
                error,
                path: out.clone(),
            })?;
            let rgba = downsize(decoded.to_rgba8(), self.ceiling);

            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent).map_err(|error| StageError::Io {
                    error,
                    path: parent.to_owned(),
                })?;
            }
            image::DynamicImage::ImageRgba8(rgba)
                .save_with_format(&out, image::ImageFormat::Png)
                .map_err(|error| StageError::Image {
                    error,
                    path: out.clone(),
                })?;

            written.insert(
                format!("{}.png", name).to_ascii_lowercase(),
                format!("Textures/{}.png", name),
            );
            texture_paths.push(out);
        }

        let materials_dir = location.materials_dir();
        let mut material_paths = Vec::new();

        for (index, material) in doc.materials().enumerate() {
            let artifact = extract_material(&material, index, &written, &self.shader)?;
            let out = materials_dir.join(format!("{}.mat", artifact.name));

            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent).map_err(|error| StageError::Io {
                    error,
                    path: parent.to_owned(),
                })?;
            }
            let json = serde_json::to_vec_pretty(&artifact).map_err(|error| {
                StageError::Material {
                    error,
                    path: out.clone(),
                }
            })?;
            write_file(&out, &json)?;
            material_paths.push(out);
        }

        Ok(StagedArtifact {
            path,
            textures: texture_paths,
            materials: material_paths,
            refs,
        })
    }
}

fn extract_material(
    material: &gltf::Material,
    index: usize,
    written: &HashMap<String, String>,
    shader: &str,
) -> Result<MaterialArtifact, StageError> {
    let name = match material.name() {
        Some(name) if !name.is_empty() => name.to_owned(),
        _ => format!("material_{}", index),
    };

    let pbr = material.pbr_metallic_roughness();

    let slots: [(&str, Option<gltf::Texture>); 5] = [
        ("baseColor", pbr.base_color_texture().map(|i| i.texture())),
        (
            "metallicRoughness",
            pbr.metallic_roughness_texture().map(|i| i.texture()),
        ),
        ("normal", material.normal_texture().map(|n| n.texture())),
        ("occlusion", material.occlusion_texture().map(|o| o.texture())),
        ("emissive", material.emissive_texture().map(|i| i.texture())),
    ];

    let mut textures = std::collections::BTreeMap::new();
    let mut fallback: Option<String> = None;

    for (slot, texture) in slots {
        let Some(texture) = texture else { continue };

        let source = texture.source();
        let stem = match source.name() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => format!("image_{}", source.index()),
        };

        // Slot references resolve against written textures by
        // case-insensitive basename.
        let key = format!("{}.png", basename_stem(&stem)).to_ascii_lowercase();
        match written.get(&key) {
            Some(path) => {
                if fallback.is_none() {
                    fallback = Some(path.clone());
                }
                textures.insert(slot.to_owned(), path.clone());
            }
            None => match &fallback {
                Some(path) => {
                    tracing::warn!(
                        "Material '{}' slot '{}' references missing texture '{}', using fallback",
                        name,
                        slot,
                        stem
                    );
                    textures.insert(slot.to_owned(), path.clone());
                }
                None => {
                    return Err(StageError::EmbedMaterial {
                        material: name,
                        slot: slot.to_owned(),
                    });
                }
            },
        }
    }

    Ok(MaterialArtifact {
        name,
        shader: shader.to_owned(),
        base_color_factor: pbr.base_color_factor(),
        metallic_factor: pbr.metallic_factor(),
        roughness_factor: pbr.roughness_factor(),
        emissive_factor: material.emissive_factor(),
        textures,
    })
}

/// Strips directory components and extension from a slot reference.
fn basename_stem(reference: &str) -> &str {
    let name = reference
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(reference);
    match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    }
}

fn unique_name(name: &str, taken: &mut HashMap<String, usize>) -> String {
    let lower = name.to_ascii_lowercase();
    match taken.get_mut(&lower) {
        None => {
            taken.insert(lower, 0);
            name.to_owned()
        }
        Some(count) => {
            *count += 1;
            format!("{}_{}", name, count)
        }
    }
}

/// Proportional downsizing when the largest dimension exceeds the ceiling.
/// A texture exactly at the ceiling is left unmodified.
fn downsize(image: image::RgbaImage, ceiling: u32) -> image::RgbaImage {
    let (width, height) = image.dimensions();
    match downsized_dimensions(width, height, ceiling) {
        None => image,
        Some((w, h)) => image::imageops::resize(&image, w, h, image::imageops::FilterType::Triangle),
    }
}

fn downsized_dimensions(width: u32, height: u32, ceiling: u32) -> Option<(u32, u32)> {
    let largest = width.max(height);
    if largest <= ceiling {
        return None;
    }
    let scale = ceiling as f32 / largest as f32;
    let w = ((width as f32 * scale).round() as u32).max(1);
    let h = ((height as f32 * scale).round() as u32).max(1);
    Some((w, h))
}

fn data_uri_bytes(uri: &str) -> Option<Vec<u8>> {
    let comma = uri.find(',')?;
    let (head, body) = uri.split_at(comma);
    let body = &body[1..];
    if head.ends_with(";base64") {
        STANDARD.decode(body).ok()
    } else {
        Some(body.as_bytes().to_vec())
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), StageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| StageError::Io {
            error,
            path: parent.to_owned(),
        })?;
    }
    fs::write(path, data).map_err(|error| StageError::Io {
        error,
        path: path.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_kind() {
        assert_eq!(AssetKind::guess("a/ship.GLB"), Some(AssetKind::Container));
        assert_eq!(AssetKind::guess("skin.png"), Some(AssetKind::Texture));
        assert_eq!(AssetKind::guess("geo.bin"), Some(AssetKind::RawBuffer));
        assert_eq!(AssetKind::guess("weird.xyz"), None);
    }

    #[test]
    fn downsize_boundary() {
        // Exactly at the ceiling: untouched.
        assert_eq!(downsized_dimensions(512, 256, 512), None);
        assert_eq!(downsized_dimensions(512, 512, 512), None);

        // One pixel over: proportional downsizing, aspect preserved.
        assert_eq!(downsized_dimensions(513, 513, 512), Some((512, 512)));
        let (w, h) = downsized_dimensions(1024, 512, 512).unwrap();
        assert_eq!((w, h), (512, 256));
    }

    #[test]
    fn downsize_never_zero() {
        let (w, h) = downsized_dimensions(4096, 1, 512).unwrap();
        assert_eq!((w, h), (512, 1));
    }

    #[test]
    fn basename_stems() {
        assert_eq!(basename_stem("Textures/Albedo.png"), "Albedo");
        assert_eq!(basename_stem("albedo"), "albedo");
        assert_eq!(basename_stem("a\\b\\c.jpg"), "c");
    }

    #[test]
    fn unique_names() {
        let mut taken = HashMap::new();
        assert_eq!(unique_name("skin", &mut taken), "skin");
        assert_eq!(unique_name("Skin", &mut taken), "Skin_1");
        assert_eq!(unique_name("skin", &mut taken), "skin_2");
    }

    #[test]
    fn data_uri_decodes() {
        assert_eq!(
            data_uri_bytes("data:application/octet-stream;base64,aGVsbG8=").unwrap(),
            b"hello"
        );
        assert_eq!(data_uri_bytes("data:,raw").unwrap(), b"raw");
    }
}
