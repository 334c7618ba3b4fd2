use clap::{Parser, Subcommand};
use tracing::Level;

use carton::model::ContainerConfig;
use carton::registry::RegistryClient;
use carton::storage::FileStorage;
use carton::{barrier, containers, images, run};

#[derive(Parser)]
#[command(version, about = "Rootless OCI container runtime", long_about = None)]
struct Cli {
    /// Verbose diagnostics
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored images
    Images,
    /// Fetch image(s) from a registry (docker.io/ prefix required)
    Pull {
        #[arg(required = true, num_args = 1..)]
        image: Vec<String>,
    },
    /// Launch a container
    Run {
        /// Container id; generated when omitted
        #[arg(long)]
        name: Option<String>,
        /// Override the image entrypoint (shell-quoted)
        #[arg(long)]
        entrypoint: Option<String>,
        /// Detach and leave the container running
        #[arg(short = 'd', long)]
        daemon: bool,
        /// Remove the container once it exits
        #[arg(long = "rm")]
        remove: bool,
        /// Hardlink SRC into the rootfs at DST (SRC:DST)
        #[arg(short = 'v', long = "volume", value_name = "SRC:DST")]
        volume: Vec<String>,
        image: String,
        /// Command to run instead of the image Cmd
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// List container records
    Ps,
    /// Remove a container
    Rm {
        /// Stop a running container first (SIGTERM, then SIGKILL)
        #[arg(short, long)]
        force: bool,
        container: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::TRACE } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    // SIGUSR1 drives the fork barrier; block it before anything can spawn
    // a thread that would otherwise steal the delivery
    barrier::reserve_signal()?;

    let storage = FileStorage::open_default()?;

    match cli.command {
        Commands::Images => {
            images::cmd_images(&storage)?;
        }
        Commands::Pull { image } => {
            let client = RegistryClient::docker();
            images::cmd_pull(&storage, &client, &image)?;
        }
        Commands::Run {
            name,
            entrypoint,
            daemon,
            remove,
            volume,
            image,
            command,
        } => {
            let config = ContainerConfig {
                image_name: image,
                entrypoint,
                command: (!command.is_empty()).then(|| command.join(" ")),
                name,
                daemon,
                remove,
                volumes: volume,
            };
            let code = run::run(&storage, &config)?;
            std::process::exit(code);
        }
        Commands::Ps => {
            containers::cmd_ps(&storage)?;
        }
        Commands::Rm { force, container } => {
            containers::cmd_rm(&storage, &container, force)?;
        }
    }

    Ok(())
}
