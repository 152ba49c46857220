mod handlers;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use virtscope::{
    cli::{VirtscopeArgs, VirtscopeSubcommand},
    VirtscopeResult,
};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> VirtscopeResult<()> {
    let args = VirtscopeArgs::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("no .env file loaded: {}", e);
    }

    let config = handlers::load_config(&args.config, args.uri).await?;

    match args.subcommand {
        VirtscopeSubcommand::Run {
            strategy,
            name,
            timeout,
            image,
            template,
            fetch,
            convert,
        } => {
            handlers::run_subcommand(
                config, strategy, name, timeout, image, template, fetch, convert,
            )
            .await?;
        }
        VirtscopeSubcommand::List => {
            handlers::list_subcommand(config)?;
        }
        VirtscopeSubcommand::Volumes => {
            handlers::volumes_subcommand(config)?;
        }
        VirtscopeSubcommand::Snapshots { domain } => {
            handlers::snapshots_subcommand(config, &domain)?;
        }
        VirtscopeSubcommand::SaveSnapshots { domain } => {
            handlers::save_snapshots_subcommand(config, &domain).await?;
        }
        VirtscopeSubcommand::SaveXml { domain } => {
            handlers::save_xml_subcommand(config, &domain).await?;
        }
        VirtscopeSubcommand::Rename { name, new_name } => {
            handlers::rename_subcommand(config, &name, &new_name)?;
        }
        VirtscopeSubcommand::Delete { name } => {
            handlers::delete_subcommand(config, &name)?;
        }
        VirtscopeSubcommand::Fetch => {
            handlers::fetch_subcommand(config).await?;
        }
        VirtscopeSubcommand::Convert { path } => {
            handlers::convert_subcommand(config, &path).await?;
        }
    }

    Ok(())
}
