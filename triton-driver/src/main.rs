use anyhow::Result;
use clap::{Parser, Subcommand};

use triton_driver::config::DriverConfig;
use triton_driver::driver::TritonDriver;
use triton_driver::store;

/// Manage a single Docker host on Joyent Triton.
///
/// Credentials and sizing come from TRITON_* environment variables (a
/// .env file is honored); the machine record is persisted under the store
/// directory between invocations.
#[derive(Parser)]
#[command(name = "triton-driver", version, about)]
struct Cli {
    /// Machine name, unique within the account.
    #[arg(long, env = "TRITON_MACHINE_NAME", default_value = "triton-machine")]
    name: String,

    /// Local state directory.
    #[arg(long, env = "TRITON_STORE_PATH", default_value = ".triton")]
    store: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision the machine and wait until it is running.
    Create,
    /// Delete the machine (succeeds if it is already gone).
    Rm,
    /// Start the machine.
    Start,
    /// Stop the machine gracefully.
    Stop,
    /// Reboot the machine.
    Restart,
    /// Stop the machine (no forceful path exists).
    Kill,
    /// Print the driver state of the machine.
    Status,
    /// Print the machine's IP address.
    Ip,
    /// Print the Docker endpoint URL.
    Url,
    /// Print an ssh_config stanza for the machine.
    SshConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Create => {
            let config = DriverConfig::from_env(&cli.name, &cli.store)?;
            let mut driver = TritonDriver::new(config);
            driver.pre_create_check()?;
            driver.create().await?;
            store::save(&driver).await?;
            println!(
                "✅ machine '{}' is running (id {})",
                cli.name,
                driver.machine_id.as_deref().unwrap_or("unknown")
            );
        }
        Command::Rm => {
            let driver = store::load(&cli.store, &cli.name).await?;
            driver.remove().await?;
            // The remote machine is gone; drop the local record too.
            let _ = tokio::fs::remove_dir_all(driver.config.machine_dir()).await;
            println!("✅ machine '{}' removed", cli.name);
        }
        Command::Start => {
            let driver = store::load(&cli.store, &cli.name).await?;
            driver.start().await?;
            println!("✅ machine '{}' starting", cli.name);
        }
        Command::Stop => {
            let driver = store::load(&cli.store, &cli.name).await?;
            driver.stop().await?;
            println!("✅ machine '{}' stopping", cli.name);
        }
        Command::Restart => {
            let driver = store::load(&cli.store, &cli.name).await?;
            driver.restart().await?;
            println!("✅ machine '{}' restarting", cli.name);
        }
        Command::Kill => {
            let driver = store::load(&cli.store, &cli.name).await?;
            driver.kill().await?;
            println!("✅ machine '{}' stopping", cli.name);
        }
        Command::Status => {
            let driver = store::load(&cli.store, &cli.name).await?;
            println!("{}", driver.state().await);
        }
        Command::Ip => {
            let driver = store::load(&cli.store, &cli.name).await?;
            println!("{}", driver.ip().await?);
        }
        Command::Url => {
            let driver = store::load(&cli.store, &cli.name).await?;
            println!("{}", driver.url().await?);
        }
        Command::SshConfig => {
            let driver = store::load(&cli.store, &cli.name).await?;
            let hostname = driver.ssh_hostname().await?;
            println!("Host {}", cli.name);
            println!("  HostName {}", hostname);
            println!("  User {}", driver.ssh_username());
            println!("  Port {}", driver.ssh_port());
            println!("  IdentityFile {}", driver.config.ssh_key_path().display());
        }
    }
    Ok(())
}
