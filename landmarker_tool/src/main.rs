use std::{
    fs, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use color_eyre as ey;
use ey::eyre::{bail, Context};
use landmarker_content::{
    asset_paths::{AssetPathTable, ScanPattern},
    cache_builder::{build_cache, CacheOptions, CacheReport, Concurrency},
    collection::{AllCacheCollection, CollectionStore, FileCollectionStore},
    landmark::{InplaceLandmarkStore, LandmarkStore, SeparateDirLandmarkStore},
    template::{upgrade_legacy_templates, FileTemplateStore},
    Mode, CACHE_DIR_NAME, LANDMARK_DIR_NAME, TEMPLATE_DIR_NAME,
};
use landmarker_server::{auth, AppState, ServerConfig, DEFAULT_PORT};
use landmarker_shared::{
    absolute_path,
    log::{self, info, warn},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
enum CommandLineArguments {
    /// Cache the assets and serve them to landmarker.io
    Serve(Serve),
    /// Cache the assets without starting the server
    Cache(Cache),
    /// Write a YAML template next to every legacy text template
    UpgradeTemplates(UpgradeTemplates),
}

#[derive(Parser, Debug)]
struct AssetArgs {
    /// Kind of the assets: 'image' or 'mesh'
    mode: Mode,

    /// Directory with the assets
    asset_dir: PathBuf,

    /// Cache directory. Defaults to a directory inside of the asset directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Search the asset directory recursively
    #[arg(short, long)]
    recursive: bool,

    /// Only consider files with this extension
    #[arg(short, long)]
    extension: Option<String>,

    /// Cache one asset after the other
    #[arg(long, conflicts_with = "threads")]
    serial: bool,

    /// Number of threads used for caching. Defaults to the number of CPUs
    #[arg(long)]
    threads: Option<usize>,
}

impl AssetArgs {
    fn cache_options(&self) -> CacheOptions {
        let asset_dir = absolute_path(&self.asset_dir);
        let cache_dir = match &self.cache_dir {
            Some(cache_dir) => absolute_path(cache_dir),
            None => asset_dir.join(CACHE_DIR_NAME),
        };
        let concurrency = match (self.serial, self.threads) {
            (true, _) => Concurrency::Serial,
            (false, Some(threads)) => Concurrency::Parallel(threads),
            (false, None) => Concurrency::default(),
        };
        CacheOptions {
            asset_dir,
            cache_dir,
            mode: self.mode,
            pattern: ScanPattern::new(self.recursive, self.extension.clone()),
            concurrency,
        }
    }
}

#[derive(Parser, Debug)]
struct Cache {
    #[command(flatten)]
    assets: AssetArgs,
}

#[derive(Parser, Debug)]
struct Serve {
    #[command(flatten)]
    assets: AssetArgs,

    /// Directory in which the landmarks are saved
    #[arg(short, long, conflicts_with = "inplace")]
    landmarks_dir: Option<PathBuf>,

    /// Save the landmarks next to the assets
    #[arg(long)]
    inplace: bool,

    /// Directory with the landmark templates
    #[arg(short, long, default_value = "~/.lmiotemplates")]
    templates_dir: PathBuf,

    /// Directory with collection files. Without it, a single collection with all assets is served
    #[arg(long)]
    collections_dir: Option<PathBuf>,

    /// Accept requests from every origin
    #[arg(long)]
    dev: bool,

    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// User name for basic authentication
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// Password for basic authentication. It is salted with the environment variable LANDMARKERIO_SALT
    #[arg(long, requires = "username")]
    password: Option<String>,
}

#[derive(Parser, Debug)]
struct UpgradeTemplates {
    /// Directory with the landmark templates
    #[arg(default_value = "~/.lmiotemplates")]
    templates_dir: PathBuf,
}

fn main() -> ey::Result<()> {
    color_eyre::install()?;

    // Setup logging
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                landmarker_shared::chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .level_for("landmarker_content", log::LevelFilter::Trace)
        .level_for("landmarker_server", log::LevelFilter::Trace)
        .chain(io::stdout())
        .apply()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    #[cfg(feature = "deadlock_detection")]
    {
        use std::thread;
        thread::spawn(move || run_deadlock_detection());
    }

    let command_line_arguments = CommandLineArguments::parse();
    match command_line_arguments {
        CommandLineArguments::Serve(serve) => run_serve(serve),
        CommandLineArguments::Cache(cache) => {
            let (_, _, report) = run_cache(&cache.assets)?;
            if !report.is_success() {
                bail!("Failed to cache {} asset(s)", report.failed.len());
            }
            Ok(())
        }
        CommandLineArguments::UpgradeTemplates(upgrade) => {
            let templates_dir = absolute_path(&upgrade.templates_dir);
            let written = upgrade_legacy_templates(&templates_dir).wrap_err("Failed to upgrade the templates")?;
            info!("Upgraded {} template(s) in '{}'", written.len(), templates_dir.display());
            Ok(())
        }
    }
}

fn run_cache(assets: &AssetArgs) -> ey::Result<(PathBuf, AssetPathTable, CacheReport)> {
    let options = assets.cache_options();
    info!(
        "Caching '{}' ({}) into '{}'",
        options.asset_dir.display(),
        options.pattern,
        options.cache_dir.display()
    );
    let result = build_cache(&options).wrap_err("Failed to build the cache")?;
    for (asset_id, err) in &result.2.failed {
        warn!("Asset {asset_id} is not served: {err}");
    }
    Ok(result)
}

fn run_serve(serve: Serve) -> ey::Result<()> {
    let mode = serve.assets.mode;
    let (cache_dir, asset_paths, _) = run_cache(&serve.assets)?;

    let landmarks: Arc<dyn LandmarkStore> = if serve.inplace {
        info!("Landmarks are saved next to the assets");
        Arc::new(InplaceLandmarkStore::new(asset_paths))
    } else {
        let landmarks_dir = match &serve.landmarks_dir {
            Some(landmarks_dir) => absolute_path(landmarks_dir),
            None => absolute_path(&serve.assets.asset_dir).join(LANDMARK_DIR_NAME),
        };
        Arc::new(SeparateDirLandmarkStore::new(landmarks_dir).wrap_err("Failed to open the landmark directory")?)
    };

    let templates_dir = absolute_path(&serve.templates_dir);
    if !templates_dir.exists() && templates_dir.ends_with(TEMPLATE_DIR_NAME) {
        warn!("Creating the empty template directory '{}'", templates_dir.display());
        fs::create_dir_all(&templates_dir).wrap_err("Failed to create the template directory")?;
    }
    let templates = FileTemplateStore::new(templates_dir, mode.n_dims()).wrap_err("Failed to load the templates")?;

    let collections: Arc<dyn CollectionStore> = match &serve.collections_dir {
        Some(collections_dir) => {
            Arc::new(FileCollectionStore::new(absolute_path(collections_dir)).wrap_err("Failed to load the collections")?)
        }
        None => Arc::new(AllCacheCollection::new(&cache_dir).wrap_err("Failed to read the cache")?),
    };

    let auth = match (serve.username, serve.password) {
        (Some(username), Some(password)) => Some(Arc::new(auth::BasicAuth::from_password(
            username,
            &password,
            auth::salt_from_env(),
        ))),
        _ => None,
    };
    let config = ServerConfig {
        mode,
        address: SocketAddr::new(serve.host, serve.port),
        dev: serve.dev,
        auth,
    };

    let state = AppState::from_cache(mode, &cache_dir, landmarks, Arc::new(templates), collections)
        .wrap_err("Failed to read the cache")?;
    let router = landmarker_server::build_router(state, &config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("Failed to start the async runtime")?;
    runtime
        .block_on(landmarker_server::serve(router, &config))
        .wrap_err("Server stopped unexpectedly")
}

#[cfg(feature = "deadlock_detection")]
fn run_deadlock_detection() {
    use landmarker_shared::{log::error, parking_lot::deadlock};
    use std::{thread, time::Duration};

    info!("Deadlock detection thread started");

    loop {
        thread::sleep(Duration::from_secs(10));
        let deadlocks = deadlock::check_deadlock();
        if deadlocks.is_empty() {
            continue;
        }

        error!("{} deadlocks detected", deadlocks.len());
        for (i, threads) in deadlocks.iter().enumerate() {
            error!("Deadlock #{i}");
            for t in threads {
                error!("Thread Id {:#?}", t.thread_id());
                error!("{:#?}", t.backtrace());
            }
        }
    }
}
