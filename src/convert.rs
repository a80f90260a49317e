//! Conversion orchestration.
//!
//! Single logical worker driving the pipeline through its steps. All
//! artifact-store calls happen on this worker; only the fetch batch runs
//! concurrently. A force-exit can be requested from any state and is
//! honored cooperatively between items.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::{
    address::{resolve, CasingTable, ContentMapping},
    artifacts::ArtifactStore,
    build::{build_with_metadata, BuildOptions, BundleBuilder, MarkedAsset},
    cleanup,
    config::Config,
    fetch::{fetch_batch, FetchedBlobs, RemoteStore},
    hash::ContentHash,
    identity,
    stage::{AssetKind, StageError, Stager},
};

/// Process outcome codes. Discriminants are part of the external contract:
/// existing values never change, new codes only append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    BuildFail = 1,
    InvalidPlatform = 2,
    DownloadFailed = 3,
    GltfCriticalError = 4,
    EmbedMaterialFailure = 5,
    UnexpectedError = 6,
    AlreadyConverted = 7,
    ConversionErrorsTolerated = 8,
}

impl ExitCode {
    /// Ordering for outcome recording. A recorded code is only replaced by
    /// one of strictly higher severity, so a late success can never mask
    /// tolerated errors.
    fn severity(self) -> u8 {
        match self {
            ExitCode::Success => 0,
            ExitCode::AlreadyConverted => 1,
            ExitCode::ConversionErrorsTolerated => 2,
            ExitCode::BuildFail
            | ExitCode::InvalidPlatform
            | ExitCode::DownloadFailed
            | ExitCode::GltfCriticalError
            | ExitCode::EmbedMaterialFailure
            | ExitCode::UnexpectedError => 3,
        }
    }
}

/// Pipeline steps. Strictly monotonic within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    Idle,
    Fetching,
    Building,
    Finished,
}

/// How an import failure affects the rest of the batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Skip this asset, keep converting, finish with errors tolerated.
    SkipAndContinue,
    /// Nothing useful can come of the batch; stop and report.
    AbortAll,
}

/// Classifies an import failure.
///
/// Per-asset content problems skip the asset. When the failed asset is the
/// batch target itself they abort instead: the batch exists to convert
/// that container and nothing else can stand in for it. Filesystem
/// failures always abort.
pub fn classify(error: &StageError, is_target: bool) -> FailureClass {
    match error {
        StageError::GltfCritical { .. }
        | StageError::ImporterNotFound { .. }
        | StageError::EmbedMaterial { .. }
            if is_target =>
        {
            FailureClass::AbortAll
        }
        StageError::GltfCritical { .. }
        | StageError::ImporterNotFound { .. }
        | StageError::EmbedMaterial { .. }
        | StageError::TextureDecode { .. }
        | StageError::Image { .. }
        | StageError::Material { .. } => FailureClass::SkipAndContinue,
        StageError::Io { .. } => FailureClass::AbortAll,
    }
}

/// Exit code describing an import failure.
fn error_code(error: &StageError) -> ExitCode {
    match error {
        StageError::GltfCritical { .. } | StageError::ImporterNotFound { .. } => {
            ExitCode::GltfCriticalError
        }
        StageError::EmbedMaterial { .. } => ExitCode::EmbedMaterialFailure,
        _ => ExitCode::UnexpectedError,
    }
}

/// Shared handle for requesting a forced exit from any state.
///
/// Items not yet started are skipped; in-flight work runs to completion.
#[derive(Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
    code: Arc<Mutex<Option<ExitCode>>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        AbortHandle::default()
    }

    pub fn force(&self, code: ExitCode) {
        let mut slot = self.code.lock();
        // First force wins.
        if slot.is_none() {
            *slot = Some(code);
        }
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_forced(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn forced_code(&self) -> Option<ExitCode> {
        *self.code.lock()
    }

    pub(crate) fn flag(&self) -> &AtomicBool {
        &self.flag
    }
}

/// Wall-clock time spent per stage. Diagnostics only.
#[derive(Clone, Copy, Debug, Default)]
pub struct StageTimers {
    pub fetching: Duration,
    pub staging: Duration,
    pub building: Duration,
    pub cleanup: Duration,
}

/// Final run report handed to the reporter sink and the caller.
#[derive(Debug)]
pub struct Report {
    pub code: ExitCode,
    pub total: usize,
    pub converted: usize,
    pub skipped: usize,
    pub timers: StageTimers,
}

/// Run progress sink. Disposed exactly once, at run end.
pub trait Reporter {
    fn step(&mut self, step: Step);
    fn dispose(self: Box<Self>, report: &Report);
}

/// Reporter writing through the log.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn step(&mut self, step: Step) {
        tracing::info!("Entering step {:?}", step);
    }

    fn dispose(self: Box<Self>, report: &Report) {
        tracing::info!(
            "Conversion finished: {:?} ({}/{} converted, {} skipped, fetch {:?}, stage {:?}, build {:?}, cleanup {:?})",
            report.code,
            report.converted,
            report.total,
            report.skipped,
            report.timers.fetching,
            report.timers.staging,
            report.timers.building,
            report.timers.cleanup,
        );
    }
}

/// One conversion run over a batch of content mappings.
pub struct Conversion<'a> {
    config: Config,
    remote: &'a dyn RemoteStore,
    artifacts: &'a mut dyn ArtifactStore,
    builder: &'a mut dyn BundleBuilder,
    reporter: Option<Box<dyn Reporter>>,
    abort: AbortHandle,
    step: Step,
    outcome: ExitCode,
    timers: StageTimers,
}

impl<'a> Conversion<'a> {
    pub fn new(
        config: Config,
        remote: &'a dyn RemoteStore,
        artifacts: &'a mut dyn ArtifactStore,
        builder: &'a mut dyn BundleBuilder,
    ) -> Self {
        Conversion {
            config,
            remote,
            artifacts,
            builder,
            reporter: Some(Box::new(LogReporter)),
            abort: AbortHandle::new(),
            step: Step::Idle,
            outcome: ExitCode::Success,
            timers: StageTimers::default(),
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Handle for requesting a forced exit from outside the worker.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Records an outcome. Later codes only stick when strictly more
    /// severe, so the terminal code is append-only.
    fn record(&mut self, code: ExitCode) {
        if code.severity() > self.outcome.severity() {
            self.outcome = code;
        }
    }

    fn advance(&mut self, step: Step) {
        debug_assert!(step >= self.step);
        if step > self.step {
            self.step = step;
            if let Some(reporter) = &mut self.reporter {
                reporter.step(step);
            }
        }
    }

    /// Runs the full pipeline over `mappings` and returns the report.
    ///
    /// Duplicate hashes are converted once; the first mapping's casing and
    /// logical path win. The reporter is disposed exactly once on every
    /// exit path.
    #[tracing::instrument(skip_all, fields(target = %self.config.target, total = mappings.len()))]
    pub fn run(mut self, mappings: Vec<ContentMapping>) -> Report {
        let total = mappings.len();

        let mut casing = CasingTable::new();
        for mapping in &mappings {
            casing.record(&mapping.hash);
        }

        let mut seen: HashSet<String> = HashSet::new();
        let batch: Vec<ContentMapping> = mappings
            .into_iter()
            .filter(|m| seen.insert(m.hash.lower()))
            .collect();

        let bundle_dir = self.config.bundle_dir();

        let expected: Vec<String> = batch
            .iter()
            .map(|m| casing.restore(&m.hash.lower()))
            .collect();
        let may_skip = self.config.skip_if_exists && !self.config.always_rebuild;
        if cleanup::should_skip(&bundle_dir, &expected, may_skip) {
            tracing::info!("All {} bundles already exist, skipping", expected.len());
            self.record(ExitCode::AlreadyConverted);
            return self.finish(total, 0, batch.len());
        }

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Err(err) => {
                tracing::error!("Failed to start the fetch runtime. {:#}", err);
                self.record(ExitCode::UnexpectedError);
                return self.finish(total, 0, 0);
            }
            Ok(runtime) => runtime,
        };

        // Fetch step: fire everything, await everything.
        self.advance(Step::Fetching);
        let fetch_started = Instant::now();

        let mut items: Vec<(ContentHash, url::Url)> = Vec::with_capacity(batch.len());
        for mapping in &batch {
            match self.config.base_url.join(mapping.hash.as_str()) {
                Ok(url) => items.push((mapping.hash.clone(), url)),
                Err(err) => {
                    tracing::error!("Invalid content url for {}. {:#}", mapping.hash, err);
                    self.abort.force(ExitCode::DownloadFailed);
                }
            }
        }

        let mut blobs = FetchedBlobs::new();
        if !self.abort.is_forced() {
            let results = runtime.block_on(fetch_batch(
                self.remote,
                &items,
                self.config.fetch_concurrency,
                self.abort.flag(),
            ));

            for (hash, result) in results {
                match result {
                    Ok(bytes) => blobs.insert(&hash, bytes),
                    Err(err) => {
                        // Content is immutable and addressed by hash; a
                        // missing blob cannot be substituted.
                        tracing::error!("Failed to fetch {}. {:#}", hash, err);
                        self.abort.force(ExitCode::DownloadFailed);
                    }
                }
            }
        }
        self.timers.fetching = fetch_started.elapsed();

        if self.abort.is_forced() {
            blobs.clear();
            return self.finish(total, 0, 0);
        }

        if self.config.keep_downloads {
            self.mirror_downloads(&blobs);
        }

        // Build step: stage, normalize identity, bundle.
        self.advance(Step::Building);
        let staging_started = Instant::now();

        if let Err(err) = self.artifacts.refresh() {
            tracing::error!("Failed to refresh the artifact store. {:#}", err);
            self.record(ExitCode::UnexpectedError);
            self.timers.staging = staging_started.elapsed();
            return self.finish(total, 0, 0);
        }

        // Logical basename -> bundle name, for resolving container refs.
        let ref_index: HashMap<String, String> = batch
            .iter()
            .map(|m| (m.basename().to_ascii_lowercase(), m.hash.lower()))
            .collect();

        let target = ContentHash::from(self.config.target.as_str());
        let mut stager = Stager::new(self.config.shader.clone());
        let mut marked: Vec<MarkedAsset> = Vec::new();
        let mut converted = 0usize;
        let mut skipped = 0usize;

        for mapping in &batch {
            if self.abort.is_forced() {
                break;
            }

            let Some(blob) = blobs.take(&mapping.hash) else {
                tracing::error!("No fetched content for {}", mapping.hash);
                self.abort.force(ExitCode::DownloadFailed);
                break;
            };

            let is_target = mapping.hash == target;
            let location = resolve(&self.config.output_root, mapping);

            // An interrupted earlier run can leave imported content beside
            // the asset folder. Adopt it; content is addressed by hash and
            // trusted unchanged.
            if location.sibling_path().is_file() && !location.final_path().exists() {
                if let Err(err) = self.adopt_sibling(&location) {
                    tracing::error!(
                        "Failed to adopt leftover '{}'. {:#}",
                        location.sibling_path().display(),
                        err
                    );
                    self.abort.force(ExitCode::UnexpectedError);
                    break;
                }
            }

            let staged = AssetKind::guess(&mapping.logical_path)
                .ok_or_else(|| StageError::ImporterNotFound {
                    path: location.final_path().to_owned(),
                })
                .and_then(|kind| stager.stage(kind, blob, &location));

            let staged = match staged {
                Ok(staged) => staged,
                Err(err) => {
                    tracing::error!("Failed to import '{}'. {:#}", mapping.logical_path, err);
                    match classify(&err, is_target) {
                        FailureClass::SkipAndContinue => {
                            self.record(ExitCode::ConversionErrorsTolerated);
                            skipped += 1;
                            continue;
                        }
                        FailureClass::AbortAll => {
                            self.abort.force(error_code(&err));
                            break;
                        }
                    }
                }
            };

            if let Err(err) = self.register(&staged, &location, &mapping.hash) {
                tracing::error!("Failed to register '{}'. {:#}", mapping.logical_path, err);
                self.abort.force(ExitCode::UnexpectedError);
                break;
            }

            let mut refs: Vec<String> = Vec::new();
            for reference in &staged.refs {
                let key = crate::address::basename(reference).to_ascii_lowercase();
                match ref_index.get(&key) {
                    Some(bundle) if *bundle != mapping.hash.lower() => {
                        refs.push(bundle.clone());
                    }
                    Some(_) => {}
                    None => {
                        tracing::warn!(
                            "'{}' references '{}' which is not part of the batch",
                            mapping.logical_path,
                            reference
                        );
                    }
                }
            }
            refs.sort();
            refs.dedup();

            marked.push(MarkedAsset {
                name: mapping.hash.lower(),
                folder: location.asset_folder().to_owned(),
                refs,
            });
            converted += 1;
        }

        blobs.clear();
        tracing::debug!("{} import operations performed", stager.imported());

        if let Err(err) = self.artifacts.save_all() {
            tracing::error!("Failed to flush the artifact store. {:#}", err);
            self.record(ExitCode::UnexpectedError);
        }
        self.timers.staging = staging_started.elapsed();

        if self.abort.is_forced() {
            return self.finish(total, converted, skipped);
        }

        if marked.is_empty() {
            tracing::error!("Nothing staged, no bundles to build");
            self.record(ExitCode::BuildFail);
            return self.finish(total, converted, skipped);
        }

        let build_started = Instant::now();
        let options = BuildOptions {
            force_rebuild: self.config.always_rebuild,
            compress: true,
        };
        let suffix = self.config.platform.suffix();

        let built = std::fs::create_dir_all(&bundle_dir)
            .map_err(|err| {
                tracing::error!(
                    "Failed to create bundle directory '{}'. {:#}",
                    bundle_dir.display(),
                    err
                );
            })
            .is_ok()
            && match build_with_metadata(
                &mut *self.builder,
                &bundle_dir,
                &marked,
                &options,
                suffix,
                &casing,
            ) {
                Ok(manifest) => {
                    tracing::info!("Built {} bundles", manifest.bundles.len());
                    true
                }
                Err(err) => {
                    tracing::error!("Bundle build failed. {:#}", err);
                    false
                }
            };

        self.timers.building = build_started.elapsed();
        if !built {
            self.record(ExitCode::BuildFail);
            return self.finish(total, converted, skipped);
        }

        let cleanup_started = Instant::now();
        cleanup::cleanup(&bundle_dir, &casing);
        self.timers.cleanup = cleanup_started.elapsed();

        self.finish(total, converted, skipped)
    }

    /// Moves a leftover sibling file into the asset folder through the
    /// store so its identity sidecar, if any, travels with it.
    fn adopt_sibling(
        &mut self,
        location: &crate::address::ResolvedLocation,
    ) -> Result<(), crate::artifacts::StoreError> {
        std::fs::create_dir_all(location.asset_folder()).map_err(|error| {
            crate::artifacts::StoreError::Move {
                error,
                from: location.sibling_path().to_owned(),
                to: location.final_path().to_owned(),
            }
        })?;
        self.artifacts
            .move_asset(location.sibling_path(), location.final_path())
    }

    /// Registers a staged artifact and its sub-resources, then normalizes
    /// the main artifact's identity.
    fn register(
        &mut self,
        staged: &crate::stage::StagedArtifact,
        location: &crate::address::ResolvedLocation,
        hash: &ContentHash,
    ) -> Result<(), identity::IdentityError> {
        self.artifacts.import_at_path(&staged.path)?;
        for texture in &staged.textures {
            self.artifacts.import_at_path(texture)?;
        }
        for material in &staged.materials {
            self.artifacts.import_at_path(material)?;
        }
        identity::normalize(&mut *self.artifacts, location, hash)
    }

    fn mirror_downloads(&self, blobs: &FetchedBlobs) {
        let dir = self.config.downloads_dir();
        if let Err(err) = std::fs::create_dir_all(&dir) {
            tracing::error!(
                "Failed to create downloads directory '{}'. {:#}",
                dir.display(),
                err
            );
            return;
        }
        for (hash, bytes) in blobs.iter() {
            let path = dir.join(hash);
            if let Err(err) = std::fs::write(&path, bytes) {
                tracing::error!("Failed to keep download '{}'. {:#}", path.display(), err);
            }
        }
    }

    /// Terminal transition. Merges any forced code, moves to `Finished`
    /// and disposes the reporter.
    fn finish(mut self, total: usize, converted: usize, skipped: usize) -> Report {
        if let Some(code) = self.abort.forced_code() {
            self.record(code);
        }
        self.advance(Step::Finished);

        let report = Report {
            code: self.outcome,
            total,
            converted,
            skipped,
            timers: self.timers,
        };

        if let Some(reporter) = self.reporter.take() {
            reporter.dispose(&report);
        }

        report
    }
}
