use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    std::path::PathBuf,
    tap::prelude::*,
    tokio_util::sync::CancellationToken,
    tracing::info,
};

pub const BUFFER_SIZE: usize = 1024 * 64;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// the wapiti config file holds everything the installer needs to know
    /// about this machine: where the game lives, where downloads go and where
    /// the installation should land. generate one with `print-default-config`.
    #[arg(long, short = 'c', default_value = std::env::current_dir().unwrap().join(config_file::CONFIG_FILE_NAME).into_os_string())]
    wapiti_config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Default, Debug)]
pub struct DebugHelpers {
    /// skip verification and downloads (used mostly for developing the tool)
    #[arg(long)]
    pub skip_verify_and_downloads: bool,
    /// fast-forward to the directive with this identity hash
    #[arg(long)]
    pub start_from_directive: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// tests the modlist parser against a bundle
    ValidateModlist {
        /// path to the modlist bundle file
        path: PathBuf,
    },
    /// prints information about the modlist
    ModlistInfo {
        /// path to the modlist bundle file
        path: PathBuf,
    },
    /// performs the installation described by the config file
    Install {
        #[command(flatten)]
        debug: DebugHelpers,
    },
    /// prints the default config. save it and modify to your liking
    PrintDefaultConfig,
}

pub mod compression;
pub mod config_file;
pub mod consts;
pub mod data_dir;
pub mod downloaders;
pub mod error;
pub mod file_signature;
pub mod hash_cache;
pub mod install_modlist;
pub mod modlist_file;
pub mod modlist_json;
pub mod octodiff;
pub mod paths;
pub mod progress_bars;
pub mod read_wrappers;
pub mod resources;
pub mod utils;
pub mod vfs;

fn setup_logging() {
    use {
        tracing_indicatif::IndicatifLayer,
        tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter},
    };
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .try_init()
        .expect("logging failed");
}

fn modlist_summary(modlist: &modlist_json::Modlist) -> String {
    use itertools::Itertools;
    let by_kind = modlist
        .directives
        .iter()
        .counts_by(|directive| directive.directive_kind())
        .into_iter()
        .sorted_by_key(|(_, count)| std::cmp::Reverse(*count))
        .map(|(kind, count)| format!("  {kind}: {count}"))
        .join("\n");
    format!(
        "{name} {version} (game: {game})\narchives: {archives} ({total_size} bytes)\ndirectives:\n{by_kind}",
        name = modlist.name,
        version = modlist.version,
        game = modlist.game_type,
        archives = modlist.archives.len(),
        total_size = modlist.archives.iter().map(|archive| archive.descriptor.size).sum::<u64>(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    consts::cleanup_stale_temp_dirs()
        .context("cleaning up stale temp directories")
        .tap_err(|error| tracing::warn!("{error:#}"))
        .ok();
    let Cli { command, wapiti_config } = Cli::parse();

    let cancellation = CancellationToken::new();
    tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("cancellation requested, stopping at the next phase boundary");
                cancellation.cancel();
            }
        }
    });

    match command {
        Commands::ValidateModlist { path } => tokio::fs::read_to_string(&path)
            .await
            .context("reading test file")
            .and_then(|input| modlist_json::parsing_helpers::validate_modlist_file(&input))
            .with_context(|| format!("testing file {}", path.display())),
        Commands::ModlistInfo { path } => modlist_file::ModlistFile::load(path)
            .context("reading modlist")
            .map(|(_, modlist)| modlist_summary(&modlist.modlist))
            .map(|summary| println!("\n{summary}")),
        Commands::PrintDefaultConfig => config_file::WapitiConfig::write_default().map(|config| println!("{config}")),
        Commands::Install { debug } => {
            let (config_path, config) = config_file::WapitiConfig::read(&wapiti_config).context("reading wapiti config file")?;
            info!("using config at [{}]", config_path.display());
            match install_modlist::Installer::new(config, cancellation.clone()).install(debug).await {
                Ok(_) => Ok(info!("installation completed successfully")),
                Err(errors) => {
                    errors
                        .iter()
                        .enumerate()
                        .for_each(|(idx, reason)| eprintln!("{idx}. {reason:?}", idx = idx + 1));
                    let exit_code = errors
                        .iter()
                        .find_map(|error| {
                            use error::AbortOrErrorExt;
                            error.as_abort().map(|abort| abort.exit_code())
                        })
                        .unwrap_or(2);
                    std::process::exit(exit_code)
                }
            }
        }
    }
    .with_context(|| {
        format!(
            "\n\nerror occurred, run with --help, check your configuration or file a ticket at {}",
            env!("CARGO_PKG_REPOSITORY")
        )
    })
}
