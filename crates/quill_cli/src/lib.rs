//! Command-line interface for quill.
//!
//! # Usage
//!
//! ```bash
//! # Check query documents for syntax errors
//! quill check queries/*.graphql
//!
//! # ...and validate them against the demo schema
//! quill check --demo queries/*.graphql
//!
//! # Format files in place, or only report what would change
//! quill fmt queries/*.graphql
//! quill fmt --check queries/*.graphql
//!
//! # Serve the demo schema over HTTP and WebSocket
//! quill serve --port 4000
//! ```

pub mod demo;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use quill_runtime::{Executor, ExecutorConfig, Request};
use quill_sdk::{ConnectionConfig, GraphQLApi, PubSub, Server, ServerConfig};
use quill_syntax::{parse, FormatOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

type CliResult = Result<i32, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check GraphQL query documents for errors
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Also validate against the demo schema
        #[arg(long)]
        demo: bool,
    },

    /// Format GraphQL query documents
    #[command(alias = "format")]
    Fmt {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Check if files are formatted (don't modify)
        #[arg(long)]
        check: bool,

        /// Indentation size
        #[arg(long, default_value = "2")]
        indent: usize,

        /// Use tabs instead of spaces
        #[arg(long)]
        tabs: bool,
    },

    /// Serve the demo schema
    Serve(ServeArgs),

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "4000")]
    pub port: u16,

    /// Path serving GraphQL
    #[arg(long, default_value = "/graphql")]
    pub path: String,

    /// Keep-alive interval for WebSocket connections, in seconds
    #[arg(long, default_value = "15")]
    pub keep_alive: u64,

    /// Reject operations costing more than this
    #[arg(long)]
    pub max_cost: Option<u64>,

    /// Report each operation's cost in `extensions.cost`
    #[arg(long)]
    pub report_cost: bool,
}

impl ServeArgs {
    pub fn config(&self) -> ServerConfig {
        let mut executor = ExecutorConfig::default().with_cost_reporting(self.report_cost);
        if let Some(max_cost) = self.max_cost {
            executor = executor.with_max_cost(max_cost);
        }
        ServerConfig::new()
            .host(self.host.clone())
            .port(self.port)
            .path(self.path.clone())
            .executor(executor)
            .connection(
                ConnectionConfig::new().keep_alive(Duration::from_secs(self.keep_alive.max(1))),
            )
    }
}

pub fn run(cli: Cli) -> CliResult {
    match cli.command {
        Commands::Check { files, demo } => check_files(&files, demo, cli.verbose),
        Commands::Fmt {
            files,
            check,
            indent,
            tabs,
        } => format_files(&files, check, indent, tabs, cli.verbose),
        Commands::Serve(_) => Err("serve must run on the async runtime".into()),
        Commands::Version => {
            println!("quill {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

/// Serves the demo schema until Ctrl-C.
pub async fn serve(args: ServeArgs) -> CliResult {
    let config = args.config();
    let pubsub = PubSub::new();
    let api = GraphQLApi::builder(demo::schema(&pubsub)?)
        .executor_config(config.executor.clone())
        .connection_config(config.connection.clone())
        .build();

    let server = Server::bind(api, &config).await?;
    let addr = server.local_addr()?;
    println!(
        "{} http://{}{} (ws://{}{})",
        "Serving".green().bold(),
        addr,
        config.path,
        addr,
        config.path
    );
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;
    Ok(0)
}

fn read_source(file: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(file)
}

fn check_files(files: &[PathBuf], demo: bool, verbose: bool) -> CliResult {
    let executor = if demo {
        Some(Executor::new(demo::schema(&PubSub::new())?))
    } else {
        None
    };
    let mut has_errors = false;

    for file in files {
        if verbose {
            println!("{} {}", "Checking".blue(), file.display());
        }

        let source = read_source(file)?;
        let result = parse(&source);

        if result.diagnostics.has_errors() {
            has_errors = true;
            eprintln!("{} {}", "Error".red().bold(), file.display());
            for error in result.diagnostics.errors() {
                eprintln!("{:?}", error.to_report(&source));
            }
            continue;
        }

        if let Some(executor) = &executor {
            if let Err(error) = executor.prepare(&Request::new(source.as_str())) {
                has_errors = true;
                eprintln!("{} {}", "Invalid".red().bold(), file.display());
                for error in error.into_errors() {
                    eprintln!("  {} {}", "-->".blue(), error.message);
                }
                continue;
            }
        }

        if verbose {
            println!("{} {}", "OK".green(), file.display());
        }
    }

    if has_errors {
        Ok(1)
    } else {
        println!(
            "{} {} file(s) checked",
            "Success:".green().bold(),
            files.len()
        );
        Ok(0)
    }
}

fn format_files(
    files: &[PathBuf],
    check_only: bool,
    indent: usize,
    use_tabs: bool,
    verbose: bool,
) -> CliResult {
    let mut needs_formatting = false;
    let mut failed = false;

    let options = FormatOptions {
        indent_size: indent,
        use_tabs,
    };

    for file in files {
        let source = read_source(file)?;
        let result = parse(&source);

        if result.diagnostics.has_errors() {
            failed = true;
            eprintln!("{} {} - parse error", "Error".red().bold(), file.display());
            continue;
        }

        let formatted = quill_syntax::format_with_options(&result.document, options.clone());

        if check_only {
            if source != formatted {
                needs_formatting = true;
                println!("{} {}", "Would format".yellow(), file.display());
            } else if verbose {
                println!("{} {}", "OK".green(), file.display());
            }
        } else if source != formatted {
            std::fs::write(file, &formatted)?;
            println!("{} {}", "Formatted".green(), file.display());
        } else if verbose {
            println!("{} {}", "Unchanged".dimmed(), file.display());
        }
    }

    if failed || (check_only && needs_formatting) {
        Ok(1)
    } else {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parse() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_args_map_onto_config() {
        let cli = Cli::parse_from([
            "quill", "serve", "--port", "0", "--path", "api", "--max-cost", "50", "--keep-alive", "3",
        ]);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.config();
        assert_eq!(config.port, 0);
        assert_eq!(config.path, "/api");
        assert_eq!(config.executor.max_cost, Some(50));
        assert_eq!(config.connection.keep_alive, Duration::from_secs(3));
    }

    #[test]
    fn test_check_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.graphql");
        let bad = dir.path().join("bad.graphql");
        let unknown = dir.path().join("unknown.graphql");
        std::fs::write(&good, "{ hello }").unwrap();
        std::fs::write(&bad, "{ hello ").unwrap();
        std::fs::write(&unknown, "{ goodbye }").unwrap();

        assert_eq!(check_files(&[good.clone()], true, false).unwrap(), 0);
        assert_eq!(check_files(&[bad], false, false).unwrap(), 1);
        assert_eq!(check_files(&[unknown.clone()], false, false).unwrap(), 0);
        assert_eq!(check_files(&[unknown], true, false).unwrap(), 1);
    }

    #[test]
    fn test_format_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("query.graphql");
        std::fs::write(&file, "query Q{hello}").unwrap();

        assert_eq!(format_files(&[file.clone()], true, 2, false, false).unwrap(), 1);
        assert_eq!(format_files(&[file.clone()], false, 2, false, false).unwrap(), 0);
        assert_eq!(format_files(&[file.clone()], true, 2, false, false).unwrap(), 0);
        let formatted = std::fs::read_to_string(&file).unwrap();
        assert!(formatted.starts_with("query Q {"));
    }
}
