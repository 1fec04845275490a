use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use feedscout::auth::providers::{CredentialBroker, DiscoveryEnv};
use feedscout::backend::{Backend, summarize};
use feedscout::config::Config;
use feedscout::framework::Framework;
use feedscout::sources::SourceConfigResolver;

#[derive(Parser)]
#[command(name = "feedscout")]
#[command(about = "Resolve package metadata across NuGet sources", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory whose NuGet.Config hierarchy is used
    #[arg(short = 'C', long, global = true, default_value = ".")]
    directory: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    Summary,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve metadata for one or more packages
    Resolve {
        /// Package ids
        #[arg(required = true)]
        packages: Vec<String>,

        /// Target frameworks of the consuming project (e.g. net8.0, net472)
        #[arg(short, long = "framework")]
        frameworks: Vec<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "summary")]
        format: OutputFormat,

        /// Exit with code 1 if any package could not be resolved
        #[arg(long)]
        fail_on_error: bool,
    },
    /// Search every source that supports it
    Search {
        query: String,

        /// Maximum results per source
        #[arg(short, long, default_value = "20")]
        take: usize,
    },
    /// List the package sources and mapping in effect
    Sources,
    /// List credential providers, optionally negotiating for a URL
    Credentials {
        /// Source URL to request a credential for
        #[arg(long)]
        uri: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Resolve {
            packages,
            frameworks,
            format,
            fail_on_error,
        } => run_resolve(config, &cli.directory, packages, frameworks, format, fail_on_error).await,
        Commands::Search { query, take } => run_search(config, &cli.directory, &query, take).await,
        Commands::Sources => run_sources(&cli.directory),
        Commands::Credentials { uri } => run_credentials(config, uri).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => match Config::default_path() {
            Some(path) => Config::load(&path),
            None => Ok(Config::default()),
        },
    }
}

async fn run_resolve(
    config: Config,
    directory: &Path,
    packages: Vec<String>,
    frameworks: Vec<String>,
    format: OutputFormat,
    fail_on_error: bool,
) -> ExitCode {
    let min_severity = config.report.min_severity_level();
    let backend = match Backend::initialize(config, directory).await {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let frameworks: Vec<Framework> = frameworks.iter().map(|f| Framework::parse(f)).collect();
    let results = backend.resolve(&packages).await;

    // Report in the order the packages were requested
    let mut ordered: Vec<_> = results.into_iter().collect();
    ordered.sort_by_key(|(id, _)| {
        packages
            .iter()
            .position(|p| p.eq_ignore_ascii_case(id))
            .unwrap_or(usize::MAX)
    });

    let failures = ordered.iter().filter(|(_, r)| r.is_err()).count();

    match format {
        OutputFormat::Json => {
            let report: Vec<serde_json::Value> = ordered
                .iter()
                .map(|(id, result)| match result {
                    Ok(info) => serde_json::json!({
                        "id": id,
                        "summary": summarize(info, &frameworks, min_severity),
                        "package": info,
                    }),
                    Err(e) => serde_json::json!({
                        "id": id,
                        "error": e.to_string(),
                        "not_found": e.is_not_found(),
                    }),
                })
                .collect();
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Failed to serialize report: {}", e),
            }
        }
        OutputFormat::Summary => {
            for (id, result) in &ordered {
                match result {
                    Ok(info) => {
                        let summary = summarize(info, &frameworks, min_severity);
                        println!("{} ({})", summary.id, summary.source);
                        println!(
                            "  latest:            {}",
                            summary.latest.as_deref().unwrap_or("-")
                        );
                        println!(
                            "  latest stable:     {}",
                            summary.latest_stable.as_deref().unwrap_or("-")
                        );
                        if !frameworks.is_empty() {
                            println!(
                                "  latest compatible: {}",
                                summary.latest_compatible.as_deref().unwrap_or("-")
                            );
                        }
                        if let Some(downloads) = summary.total_downloads {
                            println!("  downloads:         {}", downloads);
                        }
                        if summary.deprecated {
                            match &summary.alternate_package_id {
                                Some(alternate) => println!("  deprecated, use {} instead", alternate),
                                None => println!("  deprecated"),
                            }
                        }
                        for advisory in &summary.vulnerabilities {
                            println!("  advisory: {}", advisory);
                        }
                    }
                    Err(e) => println!("{}: {}", id, e),
                }
            }
        }
    }

    if fail_on_error && failures > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_search(config: Config, directory: &Path, query: &str, take: usize) -> ExitCode {
    let backend = match Backend::initialize(config, directory).await {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let results = backend.search(query, take).await;
    if results.is_empty() {
        eprintln!("No configured source supports search");
        return ExitCode::FAILURE;
    }

    for (source, result) in results {
        match result {
            Ok(response) => {
                println!("{} ({} hits)", source, response.total_hits);
                for hit in response.data {
                    println!(
                        "  {} {}{}",
                        hit.id,
                        hit.version,
                        hit.total_downloads
                            .map(|d| format!(" ({} downloads)", d))
                            .unwrap_or_default()
                    );
                }
            }
            Err(e) => eprintln!("{}: {}", source, e),
        }
    }

    ExitCode::SUCCESS
}

fn run_sources(directory: &Path) -> ExitCode {
    let set = match SourceConfigResolver::from_process().resolve(directory) {
        Ok(set) => set,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("Sources (highest priority first):");
    for source in &set.sources {
        let auth = if source.credential.is_some() {
            " [credentials]"
        } else {
            ""
        };
        println!("  {} -> {}{}", source.name, source.url, auth);
    }

    if set.routing.is_enabled() {
        println!("\nPackage source mapping:");
        for entry in set.routing.entries() {
            println!("  {}: {}", entry.source, entry.patterns.join(", "));
        }
    }

    if !set.config_files.is_empty() {
        println!("\nConfiguration files:");
        for file in &set.config_files {
            println!("  {}", file.display());
        }
    }

    ExitCode::SUCCESS
}

async fn run_credentials(config: Config, uri: Option<String>) -> ExitCode {
    let broker = CredentialBroker::discover(&DiscoveryEnv::from_process(), &config.credentials);

    if broker.is_empty() {
        println!("No credential providers found");
    } else {
        println!("Credential providers:");
        for name in broker.provider_names() {
            println!("  {}", name);
        }
    }

    let Some(uri) = uri else {
        return ExitCode::SUCCESS;
    };

    match broker.negotiate(&uri).await {
        Some(credential) => {
            println!(
                "Obtained credential for {} (user: {}, password: {})",
                uri,
                credential.username,
                feedscout::auth::redact_token(&credential.password)
            );
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("No provider returned a credential for {}", uri);
            ExitCode::FAILURE
        }
    }
}
