//! Run setup: logging, configuration, output directory and the training run.

use bprim_data::{Checkpoint, seed_patches};
use bprim_train::baseline::{BaselineTrainer, SplatSet};
use bprim_train::{DirectorySink, TrainingConfig, TrainingOrchestrator};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cli::Args;
use crate::error::AppError;
use crate::remote::RemoteSession;
use crate::render::{SoftwarePatchBackend, SoftwareSplatBackend};
use crate::report::TracingReportSink;
use crate::scene::load_scene;

const OUTPUT_ROOT: &str = "outputs";

pub fn run(args: Args) -> Result<(), AppError> {
    init_logging(args.quiet);

    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_json_file(path)?,
        None => TrainingConfig::default(),
    };
    args.apply_to(&mut config);
    config.validate()?;

    let model_path = match &config.model.model_path {
        Some(path) => {
            std::fs::create_dir_all(path)?;
            path.clone()
        }
        None => create_run_directory(Path::new(OUTPUT_ROOT))?,
    };
    config.model.model_path = Some(model_path.clone());
    info!("Output folder: {}", model_path.display());
    config.write_json(model_path.join("cfg_args.json"))?;

    let scene = load_scene(&config.model.source_path, config.model.white_background, args.seed)?;
    let primitives = seed_patches(&scene.points, config.model.init_opacity, config.schedule.area_threshold);
    if primitives.is_empty() {
        return Err(AppError::NoPrimitives {
            points: scene.points.len(),
        });
    }
    let splats = SplatSet::from_points(&scene.points, config.model.init_opacity, config.model.sh_degree);
    let baseline = BaselineTrainer::new(
        splats,
        &config.optimization,
        config.baseline.clone(),
        config.schedule.sh_increase_interval,
        scene.extent,
        args.seed,
    );
    let reporter = TracingReportSink::with_log_file(&model_path.join("scalars.jsonl"))?;

    let mut orchestrator = TrainingOrchestrator::new(
        config,
        args.run_options(),
        scene,
        primitives,
        Box::new(SoftwarePatchBackend::new()),
    )?
    .with_baseline(baseline, Box::new(SoftwareSplatBackend::new()))
    .with_reporter(Box::new(reporter))
    .with_checkpoint_sink(Box::new(DirectorySink::new(&model_path)));

    if !args.disable_viewer {
        let addr = format!("{}:{}", args.ip, args.port);
        let session = RemoteSession::bind(&addr).map_err(|source| AppError::Bind { addr, source })?;
        orchestrator = orchestrator.with_session(Box::new(session));
    }

    if let Some(path) = &args.start_checkpoint {
        info!("Resuming from {}", path.display());
        orchestrator.restore(Checkpoint::load(path)?)?;
    }

    let summary = orchestrator.run()?;
    info!(
        "Finished at iteration {} with {} primitives, {} edits, checkpoints {:?}",
        summary.final_iteration, summary.primitives, summary.edits, summary.checkpoints
    );
    Ok(())
}

fn init_logging(quiet: bool) {
    let level = if quiet { "warn" } else { "info" };

    #[cfg(feature = "tracy")]
    {
        use tracing_subscriber::Layer;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        tracing_subscriber::registry()
            .with(tracing_tracy::TracyLayer::default())
            .with(
                tracing_subscriber::fmt::layer().with_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
                ),
            )
            .init();
    }

    #[cfg(not(feature = "tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
            )
            .with_target(false)
            .init();
    }
}

/// `{root}/YYYYMMDD_HHMMSS` in UTC, with a numeric suffix on collision.
fn create_run_directory(root: &Path) -> std::io::Result<PathBuf> {
    let name = time::OffsetDateTime::now_utc()
        .format(time::macros::format_description!("[year][month][day]_[hour][minute][second]"))
        .map_err(std::io::Error::other)?;
    let base = root.join(&name);
    let mut path = base.clone();
    let mut counter = 1;
    while path.exists() {
        path = root.join(format!("{name}.{counter}"));
        counter += 1;
    }
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_directories_do_not_collide() {
        let root = std::env::temp_dir().join(format!("bprim-runs-{}", std::process::id()));
        let first = create_run_directory(&root).unwrap();
        let second = create_run_directory(&root).unwrap();
        assert_ne!(first, second);
        assert!(first.is_dir() && second.is_dir());
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name.len(), 15);
        assert_eq!(name.as_bytes()[8], b'_');
        assert!(name.chars().filter(|c| *c != '_').all(|c| c.is_ascii_digit()));
        std::fs::remove_dir_all(&root).ok();
    }
}
