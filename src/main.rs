use std::{path::Path, process::ExitCode, sync::Arc};

use canopy::{
    application::{error::AppError, repos::ContentRepository},
    cache::{
        CacheConfig, PublishedCache,
        persistence::{self, decode_header},
        seed::{RepositoryRoots, seed_keys},
    },
    config,
    domain::content::TreeKind,
    infra::{fixture::FixtureRepository, telemetry},
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_application_error(&error);
            error.exit_code()
        }
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?report.messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Warm(args) => run_warm(settings, args).await,
        config::Command::Seed(args) => run_seed(settings, args).await,
        config::Command::Inspect(args) => run_inspect(args).await,
    }
}

async fn load_repository(settings: &config::Settings) -> Result<FixtureRepository, AppError> {
    match settings.fixture.path.as_deref() {
        Some(path) => Ok(FixtureRepository::load(path).await?),
        None => {
            info!(target = "canopy::fixture", "No fixture configured; starting empty");
            Ok(FixtureRepository::new())
        }
    }
}

async fn run_warm(settings: config::Settings, args: config::WarmArgs) -> Result<(), AppError> {
    let repository: Arc<dyn ContentRepository> = Arc::new(load_repository(&settings).await?);
    let cache = PublishedCache::new(&CacheConfig::from(&settings.cache), repository);
    let cancel = CancellationToken::new();

    let result = if args.clear {
        cache.clear_memory_cache(cancel).await.map(|_| ())
    } else {
        cache.start(cancel).await.map(|_| ())
    };

    for tree in TreeKind::ALL {
        let snapshot = cache.acquire_snapshot(tree);
        println!(
            "{tree}: {status} nodes={nodes} roots={roots}",
            status = cache.status(tree),
            nodes = snapshot.node_count(),
            roots = snapshot.roots().len(),
        );
    }

    cache.shutdown().await;
    result.map_err(AppError::from)
}

async fn run_seed(settings: config::Settings, args: config::SeedArgs) -> Result<(), AppError> {
    let repository: Arc<dyn ContentRepository> = Arc::new(load_repository(&settings).await?);
    let cache_config = CacheConfig::from(&settings.cache);
    let tree = TreeKind::from(args.tree);

    let provider = RepositoryRoots::new(
        repository,
        tree,
        cache_config.children_page_size_non_zero().get(),
    );
    let keys = seed_keys(
        &provider,
        cache_config.seed_count(tree),
        CancellationToken::new(),
    )
    .await?;

    for key in &keys {
        if args.json {
            let line = serde_json::to_string(key)
                .map_err(|err| AppError::unexpected(format!("failed to encode seed key: {err}")))?;
            println!("{line}");
        } else {
            println!("{} {}", key.id, key.depth);
        }
    }
    Ok(())
}

async fn run_inspect(args: config::InspectArgs) -> Result<(), AppError> {
    let path = args.file.clone();
    let loaded = tokio::task::spawn_blocking(move || inspect_file(&path))
        .await
        .map_err(|err| AppError::unexpected(format!("inspect task failed: {err}")))??;
    let (header, generation) = loaded;

    println!("schema_version={}", header.schema_version);
    println!("generation={}", header.generation);
    println!("watermark={}", header.watermark);
    println!("records={}", header.record_count);
    println!("checksum={}", hex::encode(header.checksum));

    if args.records {
        for entry in &generation.outline {
            let parent = entry
                .parent_id
                .map(|parent| parent.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{id} parent={parent} outline", id = entry.id);
        }
        for node in &generation.nodes {
            let parent = node
                .parent_id()
                .map(|parent| parent.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{id} parent={parent} version={version} published={published}",
                id = node.id(),
                version = node.source_version(),
                published = node.has_published(),
            );
        }
    }
    Ok(())
}

fn inspect_file(
    path: &Path,
) -> Result<(persistence::FileHeader, persistence::LoadedGeneration), AppError> {
    let bytes = std::fs::read(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => {
            AppError::not_found(format!("cache file {}", path.display()))
        }
        _ => canopy::infra::error::InfraError::from(err).into(),
    })?;
    let header = decode_header(&bytes)?;
    let generation = persistence::decode(&bytes)?;
    Ok((header, generation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspecting_a_missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");

        let err = inspect_file(&dir.path().join("document.canopy")).unwrap_err();

        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(err.exit_code(), ExitCode::from(66));
    }
}
