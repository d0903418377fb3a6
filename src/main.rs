use clap::{Parser, Subcommand};
use tracing::error;

use ssm_toolkit::aws::AwsContext;
use ssm_toolkit::config::ToolkitConfig;
use ssm_toolkit::error::Result;
use ssm_toolkit::forward::ForwardRequest;
use ssm_toolkit::logging::init_logging;
use ssm_toolkit::{forward, inventory, run, session, ssh};

#[derive(Parser)]
#[command(name = "ssm-toolkit")]
#[command(about = "Convenience tooling for EC2 access over AWS Systems Manager")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// AWS profile to use
    #[arg(short, long, global = true)]
    profile: Option<String>,

    /// AWS region to use
    #[arg(long, global = true)]
    region: Option<String>,

    /// Configuration file path
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an interactive session on an instance
    Connect {
        /// Instance ID, IP address, DNS name or Name tag
        instance: String,
    },

    /// List instances registered in SSM
    List {
        /// EC2 filters, awscli style: Name=key,Values=v1,v2
        #[arg(short, long)]
        filters: Vec<String>,
    },

    /// Run shell commands on one or more instances
    Run {
        /// Target instances (IDs, IPs, DNS names or Name tags)
        #[arg(short, long, required = true, num_args = 1..)]
        instances: Vec<String>,

        /// Shell commands to run
        #[arg(short, long, required = true, num_args = 1..)]
        commands: Vec<String>,
    },

    /// Forward a local port to an instance or through it
    Forward {
        /// host:port to forward to, or a bare host when --remote is set
        #[arg(short, long)]
        target: String,

        /// Local port to listen on
        #[arg(short, long)]
        local: u16,

        /// Onward host:port reachable from the target instance
        #[arg(short, long)]
        remote: Option<String>,
    },

    /// ssh to an instance through Session Manager
    Ssh {
        /// Arguments passed through to ssh; the destination may be any
        /// resolvable target
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
}

async fn dispatch(cli: Cli, config: ToolkitConfig) -> Result<()> {
    let profile = cli.profile.or_else(|| config.aws.default_profile.clone());
    let region = cli.region.or_else(|| config.aws.default_region.clone());
    let ctx = AwsContext::new(profile, region).await?;
    let policy = config.command.poll_policy();

    match cli.command {
        Commands::Connect { instance } => session::cmd_connect(&ctx, &instance, &policy).await,
        Commands::List { filters } => inventory::cmd_list(&ctx, &filters, &config.cache).await,
        Commands::Run {
            instances,
            commands,
        } => run::cmd_run(&ctx, &instances, commands, &policy).await,
        Commands::Forward {
            target,
            local,
            remote,
        } => {
            let request = ForwardRequest {
                target,
                local_port: local,
                remote,
            };
            forward::cmd_forward(&ctx, request, &policy).await
        }
        Commands::Ssh { args } => ssh::cmd_ssh(&ctx, &args).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ToolkitConfig::load(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let _guard = match init_logging(&config.logging, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = dispatch(cli, config).await {
        error!("{e}");
        std::process::exit(1);
    }
}
