//! devgate CLI - run several working copies of a project side by side
//!
//! Usage:
//!   devgate infra up             Create the shared network and services if absent
//!   devgate infra down           Remove shared services and the network
//!   devgate start                Allocate ports, start services, publish routing
//!   devgate stop                 Stop services and remove routing
//!   devgate status               Show allocation, hostnames and routing state
//!   devgate env                  Print the exported environment variables
//!   devgate rewrite <url>        Show how a container would reach a URL

use anyhow::{Context, Result};
use devgate::config::Config;
use devgate::docker::DockerRuntime;
use devgate::lifecycle::{EnvironmentReport, LifecycleManager, Workspace};
use devgate::loopback::LoopbackResolver;
use devgate::ports::PortSnapshot;
use devgate::vhost::{CommandController, FileRuleStore, VhostManager};
use devgate::{PKG_NAME, VERSION};
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// CLI command structure
#[derive(Debug, PartialEq, Eq)]
enum Command {
    InfraUp,
    InfraDown,
    Start,
    Stop,
    Status,
    Env,
    Rewrite { url: String },
    Help,
    Version,
}

/// Options shared by every command
#[derive(Debug, Default, PartialEq, Eq)]
struct GlobalOptions {
    workspace: Option<PathBuf>,
    config: Option<PathBuf>,
    docker_host: Option<String>,
    json: bool,
}

type Manager = LifecycleManager<DockerRuntime, FileRuleStore, CommandController>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("devgate=info".parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let (options, rest) = parse_options(&args)?;
    let command = parse_command(&rest)?;

    match command {
        Command::Help => print_help(),
        Command::Version => println!("{} {}", PKG_NAME, VERSION),
        Command::Rewrite { url } => handle_rewrite(&options, &url).await?,
        Command::InfraUp => {
            let workspace = open_workspace(&options)?;
            let manager = manager(&workspace, &options).await?;
            let report = manager.infra_up(&workspace).await?;
            if options.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Network {} ({})",
                    report.network,
                    if report.network_created { "created" } else { "existing" }
                );
                for name in &report.created {
                    println!("  {:<16} created", name);
                }
                for name in &report.existing {
                    println!("  {:<16} running", name);
                }
            }
        }
        Command::InfraDown => {
            let workspace = open_workspace(&options)?;
            let manager = manager(&workspace, &options).await?;
            manager.infra_down(&workspace).await?;
            println!("Shared infrastructure removed");
        }
        Command::Start => {
            let workspace = open_workspace(&options)?;
            let mut manager = manager(&workspace, &options).await?;
            let (host, snapshot) = observe_host(&workspace)?;
            let report = manager.start(&workspace, host, &snapshot).await?;
            print_report(&report, options.json)?;
        }
        Command::Stop => {
            let workspace = open_workspace(&options)?;
            let mut manager = manager(&workspace, &options).await?;
            let removed = manager.stop(&workspace).await?;
            if removed {
                println!("Stopped {} and removed its routing rules", workspace.identity());
            } else {
                println!("Stopped {} (no routing rules were installed)", workspace.identity());
            }
        }
        Command::Status => {
            let workspace = open_workspace(&options)?;
            let manager = manager(&workspace, &options).await?;
            let (host, snapshot) = observe_host(&workspace)?;
            let report = manager.status(&workspace, host, &snapshot).await?;
            print_report(&report, options.json)?;
        }
        Command::Env => {
            let workspace = open_workspace(&options)?;
            let manager = manager(&workspace, &options).await?;
            let (host, snapshot) = observe_host(&workspace)?;
            let report = manager.status(&workspace, host, &snapshot).await?;
            if options.json {
                println!("{}", serde_json::to_string_pretty(&report.env_vars())?);
            } else {
                print!("{}", report.to_dotenv());
            }
        }
    }

    Ok(())
}

/// Split global flags from the command words
fn parse_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut options = GlobalOptions::default();
    let mut rest = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--workspace" | "-C" => {
                let value = iter.next().context("--workspace requires a path")?;
                options.workspace = Some(PathBuf::from(value));
            }
            "--config" | "-c" => {
                let value = iter.next().context("--config requires a path")?;
                options.config = Some(PathBuf::from(value));
            }
            "--docker-host" => {
                let value = iter.next().context("--docker-host requires a value")?;
                options.docker_host = Some(value.clone());
            }
            "--json" => options.json = true,
            _ => rest.push(arg.clone()),
        }
    }

    Ok((options, rest))
}

fn parse_command(args: &[String]) -> Result<Command> {
    if args.is_empty() {
        return Ok(Command::Help);
    }

    let command = match args[0].as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "infra" => match args.get(1).map(String::as_str) {
            Some("up") => Command::InfraUp,
            Some("down") => Command::InfraDown,
            Some(other) => anyhow::bail!("Unknown infra command: '{}'. Use 'up' or 'down'", other),
            None => anyhow::bail!("Usage: devgate infra <up|down>"),
        },
        "start" | "up" => Command::Start,
        "stop" | "down" => Command::Stop,
        "status" | "ps" => Command::Status,
        "env" => Command::Env,
        "rewrite" => {
            let url = args.get(1).cloned().context("Usage: devgate rewrite <url>")?;
            Command::Rewrite { url }
        }
        other => anyhow::bail!("Unknown command: '{}'. Run 'devgate help' for usage", other),
    };
    Ok(command)
}

fn open_workspace(options: &GlobalOptions) -> Result<Workspace> {
    let path = match &options.workspace {
        Some(path) => path.clone(),
        None => env::current_dir().context("Failed to determine current directory")?,
    };
    let workspace = Workspace::open(&path, options.config.as_deref())?;
    tracing::debug!(
        workspace = %workspace.path().display(),
        identity = %workspace.identity(),
        "Workspace opened"
    );
    Ok(workspace)
}

async fn manager(workspace: &Workspace, options: &GlobalOptions) -> Result<Manager> {
    let runtime = DockerRuntime::connect(options.docker_host.as_deref()).await?;
    let proxy = &workspace.config().proxy;
    let controller = CommandController::new(&proxy.validate_command, &proxy.reload_command)?;
    let vhosts = VhostManager::new(
        FileRuleStore::new(&proxy.sites_dir),
        controller,
        proxy.listen_port,
    );
    Ok(LifecycleManager::new(runtime, vhosts))
}

/// Host address for hostnames plus the ports currently bound on the host
fn observe_host(workspace: &Workspace) -> Result<(IpAddr, PortSnapshot)> {
    let host = workspace.config().host_address_mode().resolve();
    let candidates = workspace.allocator()?.candidate_ports();
    let snapshot = PortSnapshot::from_host(candidates);
    tracing::debug!(host = %host, bound = snapshot.len(), "Observed host state");
    Ok((host, snapshot))
}

async fn handle_rewrite(options: &GlobalOptions, url: &str) -> Result<()> {
    // Only the gateway alias is needed, so a missing config is fine
    let config_path = options.config.clone().or_else(|| {
        let dir = options.workspace.clone().or_else(|| env::current_dir().ok())?;
        let path = dir.join(devgate::config::CONFIG_FILE);
        path.exists().then_some(path)
    });
    let alias = match config_path {
        Some(path) => Config::load(&path)?.project.gateway_alias,
        None => devgate::loopback::DEFAULT_GATEWAY_ALIAS.to_string(),
    };

    let resolver = LoopbackResolver::with_lookup(devgate::loopback::SystemLookup, alias);
    let rewrite = resolver.rewrite_str(url).await?;

    if options.json {
        let value = serde_json::json!({
            "url": rewrite.url.as_str(),
            "host": rewrite.host_override,
            "rewritten": rewrite.is_rewritten(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else if let Some(host) = &rewrite.host_override {
        println!("{}", rewrite.url);
        println!("Host: {}", host);
    } else {
        println!("{} (unchanged)", rewrite.url);
    }
    Ok(())
}

fn print_report(report: &EnvironmentReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Environment: {}", report.identity);
    println!("Workspace:   {}", report.workspace.display());
    if report.offset == report.preferred_offset {
        println!("Offset:      {}", report.offset);
    } else {
        println!(
            "Offset:      {} (preferred {} was taken)",
            report.offset, report.preferred_offset
        );
    }
    if report.exhausted {
        println!("Warning:     no free offset left; ports may collide");
    }
    println!("Network:     {}", report.network);
    println!(
        "Routing:     {}",
        if report.routed { "installed" } else { "not installed" }
    );
    if report.rebuilt {
        println!("Rebuilt:     dependency descriptors changed");
    }
    println!();
    for endpoint in &report.services {
        println!(
            "  {:<16} {:<48} -> 127.0.0.1:{}",
            endpoint.service, endpoint.url, endpoint.port
        );
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"
devgate - parallel development environments on one host

USAGE:
    devgate [options] <command>

COMMANDS:
    infra up                 Create the shared network and services if absent
    infra down               Remove shared services and the network

    start                    Allocate ports, start services, publish routing
    stop                     Stop services and remove routing
    status                   Show allocation, hostnames and routing state
    env                      Print the exported environment variables

    rewrite <url>            Show how a container would reach a URL

    help                     Show this help
    version                  Show version

OPTIONS:
    -C, --workspace <path>   Workspace directory (default: current directory)
    -c, --config <path>      Configuration file (default: <workspace>/devgate.toml)
        --docker-host <url>  Docker daemon (default: DOCKER_HOST or local socket)
        --json               Print reports as JSON

ENVIRONMENT:
    RUST_LOG                 Log filter (default: devgate=info)
    DOCKER_HOST              Docker daemon endpoint
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_options_and_command() {
        let (options, rest) =
            parse_options(&args(&["--json", "-C", "/w/proj-main", "status"])).unwrap();

        assert!(options.json);
        assert_eq!(options.workspace, Some(PathBuf::from("/w/proj-main")));
        assert_eq!(parse_command(&rest).unwrap(), Command::Status);
    }

    #[test]
    fn test_parse_infra_commands() {
        assert_eq!(parse_command(&args(&["infra", "up"])).unwrap(), Command::InfraUp);
        assert_eq!(parse_command(&args(&["infra", "down"])).unwrap(), Command::InfraDown);
        assert!(parse_command(&args(&["infra"])).is_err());
        assert!(parse_command(&args(&["infra", "sideways"])).is_err());
    }

    #[test]
    fn test_parse_rewrite() {
        assert_eq!(
            parse_command(&args(&["rewrite", "http://x.127.0.0.1.nip.io/"])).unwrap(),
            Command::Rewrite {
                url: "http://x.127.0.0.1.nip.io/".to_string()
            }
        );
        assert!(parse_command(&args(&["rewrite"])).is_err());
    }

    #[test]
    fn test_missing_flag_value() {
        assert!(parse_options(&args(&["--config"])).is_err());
    }

    #[test]
    fn test_empty_args_show_help() {
        assert_eq!(parse_command(&[]).unwrap(), Command::Help);
    }

    #[test]
    fn test_unknown_command() {
        let err = parse_command(&args(&["deploy"])).unwrap_err();
        assert!(err.to_string().contains("Unknown command"));
    }
}
