use std::path::PathBuf;

use clap::Parser;

use crate::{cli::styles, lifecycle::ScopeKind, utils::VIRTSCOPE_CONFIG_FILENAME};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// `virtscope` provisions throwaway virtual machines from XML templates and always removes them
#[derive(Debug, Parser)]
#[command(name = "virtscope", author, version, styles=styles::styles())]
pub struct VirtscopeArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: VirtscopeSubcommand,

    /// Configuration file
    #[arg(short, long, global = true, default_value = VIRTSCOPE_CONFIG_FILENAME)]
    pub config: PathBuf,

    /// Hypervisor connection URI, overriding the configuration
    #[arg(short, long, global = true)]
    pub uri: Option<String>,

    /// Enable verbose logging
    #[arg(short = 'V', long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum VirtscopeSubcommand {
    /// Provision a temporary domain, wait for Enter or Ctrl-C, then remove it
    #[command(name = "run")]
    Run {
        /// Lifecycle strategy: create, define or snapshot
        #[arg(short, long, default_value = "create")]
        strategy: ScopeKind,

        /// Domain name (defaults to a fresh UUID)
        #[arg(short, long)]
        name: Option<String>,

        /// Readiness timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Disk image to boot from
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Domain template file
        #[arg(long)]
        template: Option<PathBuf>,

        /// Fetch the configured remote image first
        #[arg(long)]
        fetch: bool,

        /// Convert the image with the configured converter first
        #[arg(long)]
        convert: bool,
    },

    /// List all domains
    #[command(name = "list")]
    List,

    /// List all volumes in all storage pools
    #[command(name = "volumes")]
    Volumes,

    /// List the snapshots of a domain
    #[command(name = "snapshots")]
    Snapshots {
        /// Domain name
        domain: String,
    },

    /// Save every snapshot description of a domain to the artifact directory
    #[command(name = "save-snapshots")]
    SaveSnapshots {
        /// Domain name
        domain: String,
    },

    /// Save the XML description of a domain to the artifact directory
    #[command(name = "save-xml")]
    SaveXml {
        /// Domain name
        domain: String,
    },

    /// Rename a domain
    #[command(name = "rename")]
    Rename {
        /// Current domain name
        name: String,

        /// New domain name
        new_name: String,
    },

    /// Stop and remove a domain if it exists
    #[command(name = "delete")]
    Delete {
        /// Domain name
        name: String,
    },

    /// Fetch the configured remote image
    #[command(name = "fetch")]
    Fetch,

    /// Convert a disk image with the configured converter
    #[command(name = "convert")]
    Convert {
        /// Image to convert
        path: PathBuf,
    },
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_command_is_well_formed() {
        VirtscopeArgs::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let args = VirtscopeArgs::parse_from([
            "virtscope",
            "run",
            "--strategy",
            "snapshot",
            "--name",
            "vm1",
            "--timeout",
            "5",
            "--uri",
            "memory:///",
        ]);

        assert_eq!(args.uri.as_deref(), Some("memory:///"));
        assert_eq!(args.config, PathBuf::from(VIRTSCOPE_CONFIG_FILENAME));
        match args.subcommand {
            VirtscopeSubcommand::Run {
                strategy,
                name,
                timeout,
                fetch,
                ..
            } => {
                assert_eq!(strategy, ScopeKind::Snapshot);
                assert_eq!(name.as_deref(), Some("vm1"));
                assert_eq!(timeout, Some(5));
                assert!(!fetch);
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        assert!(VirtscopeArgs::try_parse_from(["virtscope", "run", "--strategy", "reboot"]).is_err());
    }

    #[test]
    fn test_rename_arguments() {
        let args = VirtscopeArgs::parse_from(["virtscope", "rename", "old", "new"]);
        assert!(matches!(
            args.subcommand,
            VirtscopeSubcommand::Rename { ref name, ref new_name } if name == "old" && new_name == "new"
        ));
    }
}
