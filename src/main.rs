use std::path::PathBuf;

use clap::Parser;
use miette::IntoDiagnostic;
use url::Url;

use lading::{
    config::{Config, Platform, DEFAULT_FETCH_CONCURRENCY},
    convert::{Conversion, ExitCode},
    fetch::{HttpStore, RemoteStore},
    install_tracing_subscriber, DirBundler, FsArtifactStore,
};

#[derive(Debug, Parser)]
#[command(name = "lading")]
#[command(about = "Converts content-addressed assets into bundles")]
#[command(rename_all = "kebab-case")]
struct Cli {
    /// Entity pointer or content hash naming the batch target.
    #[arg(value_name = "target")]
    target: String,

    /// Output root for asset folders and bundles.
    #[arg(long, value_name = "path", default_value = "out")]
    output: PathBuf,

    /// Remote content store base URL.
    #[arg(long, value_name = "url")]
    base_url: Url,

    /// Bundle target platform: windows or osx.
    #[arg(long, value_name = "platform")]
    platform: String,

    /// Shader variant assigned to extracted materials.
    #[arg(long, value_name = "shader", default_value = "Standard")]
    shader: String,

    /// Rebuild bundles even when outputs look current.
    #[arg(long)]
    always_rebuild: bool,

    /// Keep fetched blobs on disk for debugging.
    #[arg(long)]
    keep_downloads: bool,

    /// Report already-converted instead of redoing finished work.
    #[arg(long)]
    skip_if_exists: bool,

    /// In-flight fetch cap; 0 means unbounded.
    #[arg(long, value_name = "n", default_value_t = DEFAULT_FETCH_CONCURRENCY)]
    fetch_concurrency: usize,
}

fn main() -> miette::Result<()> {
    install_tracing_subscriber();

    let cli = Cli::parse();

    // Platform is validated before any work starts; an unknown platform is
    // an outcome of its own, not a usage error.
    let platform = match cli.platform.parse::<Platform>() {
        Ok(platform) => platform,
        Err(err) => {
            tracing::error!("{}", err);
            std::process::exit(ExitCode::InvalidPlatform as i32);
        }
    };

    // Canonicalize so store registrations and bundle paths agree even when
    // the CLI was given a relative output root.
    let output_root = dunce::canonicalize(&cli.output).unwrap_or(cli.output);

    let config = Config {
        target: cli.target.clone(),
        output_root,
        base_url: cli.base_url.clone(),
        shader: cli.shader,
        platform,
        always_rebuild: cli.always_rebuild,
        keep_downloads: cli.keep_downloads,
        skip_if_exists: cli.skip_if_exists,
        fetch_concurrency: cli.fetch_concurrency,
    };

    let remote = HttpStore::new(cli.base_url);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    let ids = vec![cli.target];
    let mappings = match runtime.block_on(remote.active_entities(&ids)) {
        Ok(mappings) => mappings,
        Err(err) => {
            tracing::error!("Failed to resolve entity mappings. {:#}", err);
            std::process::exit(ExitCode::DownloadFailed as i32);
        }
    };
    drop(runtime);

    let mut artifacts = FsArtifactStore::new(&config.output_root);
    let mut builder = DirBundler::new();

    let report = Conversion::new(config, &remote, &mut artifacts, &mut builder).run(mappings);

    std::process::exit(report.code as i32);
}
