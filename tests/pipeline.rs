//! End-to-end pipeline runs against an in-memory remote store.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine};
use futures::future::BoxFuture;
use hashbrown::HashMap;
use url::Url;

use lading::{
    address::ContentMapping,
    artifacts::{FsArtifactStore, IdentityRecord},
    build::METADATA_NAME,
    config::{Config, Platform},
    convert::{Conversion, ExitCode},
    fetch::{FetchError, RemoteStore},
    hash::ContentHash,
    identity::ArtifactId,
    DirBundler,
};

struct MemoryStore {
    blobs: HashMap<String, Vec<u8>>,
    mappings: Vec<ContentMapping>,
}

impl MemoryStore {
    fn new(entries: Vec<(&str, &str, Vec<u8>)>) -> Self {
        let mut blobs = HashMap::new();
        let mut mappings = Vec::new();
        for (hash, logical_path, bytes) in entries {
            blobs.insert(hash.to_ascii_lowercase(), bytes);
            mappings.push(ContentMapping::new(hash, logical_path));
        }
        MemoryStore { blobs, mappings }
    }
}

impl RemoteStore for MemoryStore {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Vec<u8>, FetchError>> {
        Box::pin(async move {
            let key = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or("")
                .to_ascii_lowercase();
            self.blobs
                .get(&key)
                .cloned()
                .ok_or_else(|| FetchError::Status {
                    status: 404,
                    url: url.clone(),
                })
        })
    }

    fn active_entities<'a>(
        &'a self,
        _ids: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<ContentMapping>, FetchError>> {
        Box::pin(async move { Ok(self.mappings.clone()) })
    }
}

fn config(root: &Path, target: &str) -> Config {
    Config {
        target: target.to_owned(),
        output_root: root.to_owned(),
        base_url: Url::parse("https://content.test/").unwrap(),
        shader: "TestShader".to_owned(),
        platform: Platform::Windows,
        always_rebuild: false,
        keep_downloads: false,
        skip_if_exists: false,
        fetch_concurrency: 4,
    }
}

fn run(config: Config, store: &MemoryStore) -> lading::Report {
    let mut artifacts = FsArtifactStore::new(&config.output_root);
    let mut builder = DirBundler::new();
    let mappings = store.mappings.clone();
    Conversion::new(config, store, &mut artifacts, &mut builder).run(mappings)
}

/// Packs a JSON document into a binary glTF container.
fn glb(json: &str) -> Vec<u8> {
    let mut payload = json.as_bytes().to_vec();
    while payload.len() % 4 != 0 {
        payload.push(b' ');
    }
    let total = 12 + 8 + payload.len();

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(b"glTF");
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(b"JSON");
    out.extend_from_slice(&payload);
    out
}

fn png_data_uri(width: u32, height: u32) -> String {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 40, 40, 255]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    format!("data:image/png;base64,{}", STANDARD.encode(bytes))
}

/// Container with one embedded texture, one material using it, and an
/// external buffer reference to a sibling asset.
fn ship_glb(texture_width: u32, texture_height: u32) -> Vec<u8> {
    let json = format!(
        r#"{{
            "asset": {{"version": "2.0"}},
            "buffers": [{{"uri": "geo.bin", "byteLength": 4}}],
            "images": [{{"name": "skin", "uri": "{}"}}],
            "textures": [{{"source": 0}}],
            "materials": [{{
                "name": "hull",
                "pbrMetallicRoughness": {{"baseColorTexture": {{"index": 0}}}}
            }}]
        }}"#,
        png_data_uri(texture_width, texture_height)
    );
    glb(&json)
}

#[test]
fn converts_container_with_sibling_into_bundles() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new(vec![
        ("AbC123", "models/ship.glb", ship_glb(600, 300)),
        ("FF00", "models/geo.bin", b"GEO!".to_vec()),
    ]);

    let report = run(config(dir.path(), "AbC123"), &store);

    assert_eq!(report.code, ExitCode::Success);
    assert_eq!(report.converted, 2);
    assert_eq!(report.skipped, 0);

    // Bundles land under their canonical casing, suffix stripped.
    let bundles = dir.path().join("Bundles");
    assert!(bundles.join("AbC123").is_file());
    assert!(bundles.join("FF00").is_file());
    assert!(!bundles.join("abc123_windows").exists());
    assert!(!bundles.join("abc123_windows.manifest").exists());
    assert!(!bundles.join("lading-build.log").exists());

    // The container's external buffer reference became a dependency,
    // recorded under canonical casing; the build-only dependency did not.
    let metadata: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("abc123").join(METADATA_NAME)).unwrap(),
    )
    .unwrap();
    assert_eq!(metadata["version"], 1);
    assert_eq!(
        metadata["dependencies"],
        serde_json::json!(["FF00"])
    );

    // Embedded texture extracted and downsized proportionally.
    let texture = dir
        .path()
        .join("abc123")
        .join("Textures")
        .join("skin.png");
    assert_eq!(image::image_dimensions(&texture).unwrap(), (512, 256));

    // Material extracted with the configured shader and remapped slot.
    let material: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(
            dir.path().join("abc123").join("Materials").join("hull.mat"),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(material["shader"], "TestShader");
    assert_eq!(material["textures"]["baseColor"], "Textures/skin.png");
}

#[test]
fn second_run_with_skip_reports_already_converted() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new(vec![
        ("AbC123", "models/ship.glb", ship_glb(8, 8)),
        ("FF00", "models/geo.bin", b"GEO!".to_vec()),
    ]);

    let first = run(config(dir.path(), "AbC123"), &store);
    assert_eq!(first.code, ExitCode::Success);

    let mut again = config(dir.path(), "AbC123");
    again.skip_if_exists = true;
    let second = run(again, &store);
    assert_eq!(second.code, ExitCode::AlreadyConverted);
    assert_eq!(second.converted, 0);
}

#[test]
fn artifact_identity_is_deterministic_across_roots() {
    let store = MemoryStore::new(vec![
        ("AbC123", "models/ship.glb", ship_glb(8, 8)),
        ("FF00", "models/geo.bin", b"GEO!".to_vec()),
    ]);

    let mut ids = Vec::new();
    for _ in 0..2 {
        let dir = tempfile::tempdir().unwrap();
        let report = run(config(dir.path(), "AbC123"), &store);
        assert_eq!(report.code, ExitCode::Success);

        let sidecar = dir.path().join("ff00").join("ff00.bin.lading");
        ids.push(IdentityRecord::read(&sidecar).unwrap().id);
    }

    assert_eq!(ids[0], ids[1]);
    assert_eq!(ids[0], ArtifactId::derive(&ContentHash::from("FF00")));
}

#[test]
fn zero_byte_content_is_valid() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new(vec![("EE02", "buffers/empty.bin", Vec::new())]);

    let report = run(config(dir.path(), "EE02"), &store);

    assert_eq!(report.code, ExitCode::Success);
    assert_eq!(report.converted, 1);
    let staged = dir.path().join("ee02").join("ee02.bin");
    assert_eq!(std::fs::read(&staged).unwrap().len(), 0);
    assert!(dir.path().join("Bundles").join("EE02").is_file());
}

#[test]
fn sibling_failure_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new(vec![
        ("AbC123", "models/ship.glb", ship_glb(8, 8)),
        ("DD01", "models/broken.glb", b"not a container".to_vec()),
        ("FF00", "models/geo.bin", b"GEO!".to_vec()),
    ]);

    let report = run(config(dir.path(), "AbC123"), &store);

    assert_eq!(report.code, ExitCode::ConversionErrorsTolerated);
    assert_eq!(report.converted, 2);
    assert_eq!(report.skipped, 1);
    assert!(dir.path().join("Bundles").join("AbC123").is_file());
    assert!(!dir.path().join("Bundles").join("DD01").exists());
}

#[test]
fn target_failure_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new(vec![
        ("AbC123", "models/ship.glb", b"not a container".to_vec()),
        ("FF00", "models/geo.bin", b"GEO!".to_vec()),
    ]);

    let report = run(config(dir.path(), "AbC123"), &store);

    assert_eq!(report.code, ExitCode::GltfCriticalError);
    assert!(!dir.path().join("Bundles").join("FF00").exists());
}

#[test]
fn missing_content_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MemoryStore::new(vec![
        ("AbC123", "models/ship.glb", ship_glb(8, 8)),
        ("FF00", "models/geo.bin", b"GEO!".to_vec()),
    ]);
    store.blobs.remove("ff00");

    let report = run(config(dir.path(), "AbC123"), &store);

    assert_eq!(report.code, ExitCode::DownloadFailed);
    assert_eq!(report.converted, 0);
}

#[test]
fn duplicate_hashes_convert_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new(vec![
        ("EE02", "buffers/a.bin", b"payload".to_vec()),
        ("ee02", "buffers/b.bin", b"payload".to_vec()),
    ]);

    let report = run(config(dir.path(), "EE02"), &store);

    assert_eq!(report.code, ExitCode::Success);
    assert_eq!(report.total, 2);
    assert_eq!(report.converted, 1);
    // First-seen casing wins the final bundle name.
    assert!(dir.path().join("Bundles").join("EE02").is_file());
}

#[test]
fn leftover_sibling_is_adopted() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new(vec![("EE02", "buffers/a.bin", b"payload".to_vec())]);

    // Simulates an interrupted run: content landed beside the asset folder
    // but was never imported.
    std::fs::write(dir.path().join("ee02.bin"), b"payload").unwrap();

    let report = run(config(dir.path(), "EE02"), &store);

    assert_eq!(report.code, ExitCode::Success);
    assert!(!dir.path().join("ee02.bin").exists());
    let adopted = dir.path().join("ee02").join("ee02.bin");
    assert_eq!(std::fs::read(&adopted).unwrap(), b"payload");
}

#[test]
fn keep_downloads_mirrors_fetched_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new(vec![("EE02", "buffers/a.bin", b"payload".to_vec())]);

    let mut config = config(dir.path(), "EE02");
    config.keep_downloads = true;
    let report = run(config, &store);

    assert_eq!(report.code, ExitCode::Success);
    let kept = dir.path().join("downloads").join("ee02");
    assert_eq!(std::fs::read(&kept).unwrap(), b"payload");
}
