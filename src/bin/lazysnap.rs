use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use lazysnap::config::{load_config, Config, CONFIG_ENV};
use lazysnap::index::{
    DirLayerSource, ImageIndex, LayerMode, RawLayerSource, RegistryLayerSource, SpanTable,
};
use lazysnap::store::ArtifactStore;
use lazysnap::verify::VerifyPolicy;
use lazysnap::{Digest, Snapshotter};
use lazysnap_oci::{Credentials, Descriptor, ImageRef, OciManifest, Platform};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// On-demand remote snapshot engine.
#[derive(Parser, Debug)]
#[command(name = "lazysnap", version, about)]
struct Cli {
    /// Configuration file (YAML).
    #[arg(long, env = CONFIG_ENV, global = true)]
    config: Option<PathBuf>,

    /// Verification policy when no configuration file is given
    /// (always | on-fetch-only).
    #[arg(long, global = true)]
    verify: Option<VerifyPolicy>,

    /// Store root; overrides `root_path` and LAZYSNAP_ROOT.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a sparse index from local layer blobs or a registry image.
    Build(BuildArgs),
    /// Mount an index against a registry and materialize it on disk.
    Export(ExportArgs),
    /// List artifacts in the store.
    List,
    /// Pretty-print an index and its span tables.
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Directory holding layer blobs named by hex digest.
    #[arg(long, required_unless_present = "image")]
    blobs: Option<PathBuf>,

    /// OCI image manifest whose layers are indexed.
    #[arg(
        long,
        requires = "blobs",
        conflicts_with = "layer",
        required_unless_present_any = ["layer", "image"]
    )]
    manifest: Option<PathBuf>,

    /// Layer as `<digest>:<media type>`; repeat in bottom-up order.
    #[arg(long, requires = "blobs")]
    layer: Vec<String>,

    /// Pull the manifest and layer blobs for the host platform from this
    /// image instead.
    #[arg(long, conflicts_with = "blobs")]
    image: Option<String>,

    /// Registry credentials as user:password (with --image).
    #[arg(long, requires = "image")]
    user: Option<String>,

    /// Layers smaller than this are stored eagerly.
    #[arg(long)]
    min_layer_size: Option<u64>,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Index digest (sha256:...).
    #[arg(long)]
    index: Digest,

    /// Image the layers are fetched from, e.g. registry.example.com/app:1.0.
    #[arg(long)]
    image: String,

    /// Destination directory.
    #[arg(long)]
    dest: PathBuf,

    /// Snapshot ID for the temporary mount.
    #[arg(long, default_value = "export")]
    snapshot_id: String,

    /// Registry credentials as user:password.
    #[arg(long)]
    user: Option<String>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Index digest (sha256:...).
    index: Digest,

    /// Print every span, not only per-layer counts.
    #[arg(long)]
    spans: bool,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    let config = resolve_config(&cli)?;
    let store = Arc::new(ArtifactStore::new(config.root_path.clone()));

    match cli.command {
        Commands::Build(args) => cmd_build(&config, store, args).await,
        Commands::Export(args) => cmd_export(&config, store, args).await,
        Commands::List => cmd_list(&store).await,
        Commands::Inspect(args) => cmd_inspect(&store, args).await,
    }
}

fn init_tracing(log_file: Option<&Path>) -> CliResult<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| format!("--log-file {} has no file name", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}

/// The verification policy must come from somewhere explicit: the config
/// file or `--verify`.
fn resolve_config(cli: &Cli) -> CliResult<Config> {
    let mut config = match (&cli.config, cli.verify) {
        (Some(path), verify) => {
            let mut config = load_config(path)?;
            if let Some(policy) = verify {
                config.verification.policy = policy;
            }
            config
        }
        (None, Some(policy)) => {
            let mut config = Config::with_policy(policy);
            config.apply_env();
            config
        }
        (None, None) => {
            return Err(format!(
                "no verification policy: pass --config (or set {CONFIG_ENV}) or --verify"
            )
            .into())
        }
    };
    if let Some(root) = &cli.root {
        config.root_path = root.clone();
    }
    Ok(config)
}

async fn cmd_build(config: &Config, store: Arc<ArtifactStore>, args: BuildArgs) -> CliResult<()> {
    let (layers, source): (Vec<Descriptor>, Arc<dyn RawLayerSource>) =
        match (&args.image, &args.blobs) {
            (Some(image), _) => {
                let image = ImageRef::parse(image)?;
                let credentials = args.user.as_deref().map(Credentials::parse).transpose()?;
                let source = RegistryLayerSource::new(
                    image.clone(),
                    config.client_options_for(&image, credentials),
                )?;
                let layers = source.layers(&Platform::host()).await?;
                (layers, Arc::new(source) as Arc<dyn RawLayerSource>)
            }
            (None, Some(blobs)) => (
                local_layers(blobs, &args).await?,
                Arc::new(DirLayerSource::new(blobs)) as Arc<dyn RawLayerSource>,
            ),
            (None, None) => return Err("pass --blobs or --image".into()),
        };

    let snapshotter = Snapshotter::new(store, config.policy())
        .with_span_size(config.build.span_size)
        .with_layer_source(source);
    let min_layer_size = args.min_layer_size.unwrap_or(config.build.min_layer_size);
    let digest = snapshotter.build_index(&layers, min_layer_size).await?;
    println!("{digest}");
    Ok(())
}

/// Layers named by `--manifest` or by repeated `--layer`.
async fn local_layers(blobs: &Path, args: &BuildArgs) -> CliResult<Vec<Descriptor>> {
    if let Some(path) = &args.manifest {
        let manifest: OciManifest = serde_json::from_slice(&tokio::fs::read(path).await?)?;
        return Ok(manifest.layers);
    }
    let mut layers = Vec::with_capacity(args.layer.len());
    for raw in &args.layer {
        layers.push(layer_arg(blobs, raw).await?);
    }
    Ok(layers)
}

/// Parse `sha256:<hex>:<media type>`; the size comes from the blob file.
async fn layer_arg(blobs: &Path, raw: &str) -> CliResult<Descriptor> {
    let (algorithm, rest) = raw
        .split_once(':')
        .ok_or_else(|| format!("--layer {raw}: expected <digest>:<media type>"))?;
    let (hex, media_type) = rest
        .split_once(':')
        .ok_or_else(|| format!("--layer {raw}: expected <digest>:<media type>"))?;
    let digest = Digest::parse(&format!("{algorithm}:{hex}"))?;
    let size = tokio::fs::metadata(blobs.join(digest.hex())).await?.len();
    Ok(Descriptor::layer(digest, size, media_type))
}

async fn cmd_export(config: &Config, store: Arc<ArtifactStore>, args: ExportArgs) -> CliResult<()> {
    let image = ImageRef::parse(&args.image)?;
    let credentials = args.user.as_deref().map(Credentials::parse).transpose()?;
    let resolver = config.resolver_for(&image, credentials)?;

    let snapshotter =
        Snapshotter::new(store, config.policy()).with_resolver(Arc::new(resolver));
    let fs = snapshotter.open_mount(&args.snapshot_id, &args.index).await?;
    let exported = fs.export_to(&args.dest).await;
    snapshotter.unmount(&args.snapshot_id).await?;
    exported?;

    let stats = fs.stats();
    println!(
        "exported {} to {} ({} spans fetched, {} from cache)",
        args.index,
        args.dest.display(),
        stats.remote_fetches,
        stats.cache_hits
    );
    Ok(())
}

async fn cmd_list(store: &ArtifactStore) -> CliResult<()> {
    for digest in store.list().await? {
        let size = tokio::fs::metadata(store.path_of(&digest)).await?.len();
        println!("{digest}\t{size}");
    }
    Ok(())
}

async fn cmd_inspect(store: &ArtifactStore, args: InspectArgs) -> CliResult<()> {
    let index = ImageIndex::from_bytes(&store.get(&args.index).await?)?;
    println!("{}", serde_json::to_string_pretty(&index)?);

    for layer in &index.layers {
        let LayerMode::Lazy { span_table } = &layer.mode else {
            println!("{}: eager, {} bytes", layer.digest, layer.size);
            continue;
        };
        let table = SpanTable::from_bytes(&store.get(span_table).await?)?;
        println!(
            "{}: lazy, {} entries, {} spans (table {})",
            layer.digest,
            table.entries.len(),
            table.spans.len(),
            span_table
        );
        if args.spans {
            for span in &table.spans {
                println!(
                    "  {:>12} +{:<10} {} @{} {}",
                    span.layer_offset, span.length, span.path, span.file_offset, span.digest
                );
            }
        }
    }
    Ok(())
}
