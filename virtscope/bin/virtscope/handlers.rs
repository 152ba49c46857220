use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::io::{AsyncBufReadExt, BufReader};
use virtscope::{
    cli::AnsiStyles,
    config::ManagerConfig,
    image::{ImageConverter, ImageSupplier, LocalImage, QemuImgConverter, RemoteImage},
    lifecycle::{ScopeKind, ScopeOptions},
    manager::VmManager,
    repository::DeleteOutcome,
    utils, VirtscopeError, VirtscopeResult,
};

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

pub async fn load_config(path: &Path, uri: Option<String>) -> VirtscopeResult<ManagerConfig> {
    let mut config = ManagerConfig::load_or_default(path).await?;
    if let Some(uri) = uri {
        config.set_connection_uri(uri);
    }

    Ok(config)
}

#[allow(clippy::too_many_arguments)]
pub async fn run_subcommand(
    mut config: ManagerConfig,
    strategy: ScopeKind,
    name: Option<String>,
    timeout: Option<u64>,
    image: Option<PathBuf>,
    template: Option<PathBuf>,
    fetch: bool,
    convert: bool,
) -> VirtscopeResult<()> {
    if let Some(image) = image {
        config.set_image_path(Some(image));
    }
    if let Some(template) = template {
        config.set_template_path(template);
    }

    let mut image_path = match config.get_image_path() {
        Some(path) => Some(utils::absolute_path(path)?),
        None => None,
    };

    if fetch {
        image_path = Some(remote_image(&config)?.supply().await?);
    }

    if convert {
        let source = image_path.ok_or(VirtscopeError::ImagePathNotConfigured)?;
        let converter = QemuImgConverter::from(config.get_converter());
        image_path = Some(converter.convert(&source).await?);
    }

    let mut manager = VmManager::open(config)?;
    if let Some(path) = image_path {
        manager = manager.with_image_supplier(LocalImage::new(path));
    }

    let options = ScopeOptions {
        name,
        timeout: timeout.map(Duration::from_secs),
    };

    let scope = manager.enter_kind(strategy, options).await?;
    let domain = scope.domain();
    println!(
        "{} {} ({:?})",
        "Domain".header(),
        domain.name().literal(),
        scope.readiness()
    );
    if let Some(snapshot) = scope.snapshot() {
        println!("{} {}", "Snapshot".header(), snapshot.placeholder());
    }

    wait_for_shutdown().await?;

    if let Err(e) = scope.close().await {
        eprintln!("{} {}", "cleanup failed:".error(), e);
    }

    print_domains(&manager)?;
    manager.close()
}

pub fn list_subcommand(config: ManagerConfig) -> VirtscopeResult<()> {
    let manager = VmManager::open(config)?;
    print_domains(&manager)?;
    manager.close()
}

pub fn volumes_subcommand(config: ManagerConfig) -> VirtscopeResult<()> {
    let manager = VmManager::open(config)?;
    for entry in manager.list_all_volumes()? {
        println!("{:<20}: {}", entry.pool, entry.volume);
    }

    manager.close()
}

pub fn snapshots_subcommand(config: ManagerConfig, domain: &str) -> VirtscopeResult<()> {
    let manager = VmManager::open(config)?;
    for snapshot in manager.snapshots().list(domain)? {
        let marker = if snapshot.is_current() { " (current)" } else { "" };
        println!("{}{}", snapshot.name().literal(), marker);
    }

    manager.close()
}

pub async fn save_snapshots_subcommand(config: ManagerConfig, domain: &str) -> VirtscopeResult<()> {
    let manager = VmManager::open(config)?;
    for path in manager.snapshots().save_all_descriptions(domain).await? {
        println!("{}", path.display());
    }

    manager.close()
}

pub async fn save_xml_subcommand(config: ManagerConfig, domain: &str) -> VirtscopeResult<()> {
    let manager = VmManager::open(config)?;
    let path = manager.domains().save_description(domain).await?;
    println!("{}", path.display());

    manager.close()
}

pub fn rename_subcommand(config: ManagerConfig, name: &str, new_name: &str) -> VirtscopeResult<()> {
    let manager = VmManager::open(config)?;
    let domain = manager.domains().rename(name, new_name)?;
    println!("{} -> {}", name, domain.name().literal());

    manager.close()
}

pub fn delete_subcommand(config: ManagerConfig, name: &str) -> VirtscopeResult<()> {
    let manager = VmManager::open(config)?;
    match manager.domains().delete_if_exists(name)? {
        DeleteOutcome::Absent => println!("{}: does not exist", name),
        DeleteOutcome::Undefined | DeleteOutcome::Vanished => {
            println!("{} {}", "deleted".header(), name.literal())
        }
    }

    manager.close()
}

pub async fn fetch_subcommand(config: ManagerConfig) -> VirtscopeResult<()> {
    let path = remote_image(&config)?.supply().await?;
    println!("{}", path.display());
    Ok(())
}

pub async fn convert_subcommand(config: ManagerConfig, path: &Path) -> VirtscopeResult<()> {
    let source = utils::absolute_path(path)?;
    let converter = QemuImgConverter::from(config.get_converter());
    let converted = converter.convert(&source).await?;
    println!("{} {}", "New path:".header(), converted.display());
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn remote_image(config: &ManagerConfig) -> VirtscopeResult<RemoteImage> {
    let source = config
        .get_image_source()
        .clone()
        .ok_or(VirtscopeError::ImageSourceNotConfigured)?;

    Ok(RemoteImage::new(source))
}

fn print_domains(manager: &VmManager) -> VirtscopeResult<()> {
    println!("{}", "Domains:".header());
    for domain in manager.domains().list_all()? {
        let state = match domain.is_active() {
            Ok(true) => "running",
            Ok(false) => "shut off",
            Err(_) => "unknown",
        };
        println!("  {:<40} {}", domain.name(), state.placeholder());
    }

    Ok(())
}

async fn wait_for_shutdown() -> VirtscopeResult<()> {
    println!("Press Enter or Ctrl-C to shut down");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    tokio::select! {
        line = lines.next_line() => {
            line?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupted, shutting down");
        }
    }

    Ok(())
}
