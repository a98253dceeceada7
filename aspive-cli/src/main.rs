//! # aspive CLI
//!
//! Command-line host for the aspive template engine.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "aspive")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (used when it exists)
    #[arg(long, default_value = "aspive.yml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a view from the views directory
    Render {
        /// View name, relative to the views directory
        view: String,

        /// Views directory (overrides the config file)
        #[arg(long, env = "ASPIVE_VIEWS")]
        views: Option<PathBuf>,

        /// Render options as a JSON object
        #[arg(long, conflicts_with = "opts_file")]
        opts: Option<String>,

        /// Read render options from a JSON file
        #[arg(long)]
        opts_file: Option<PathBuf>,

        /// Layout view to wrap the output in
        #[arg(long)]
        template: Option<String>,

        /// Skip the markdown pass
        #[arg(long)]
        no_markdown: bool,

        /// Write the result to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Balance the markup of a file (or stdin) and print it
    CloseTags {
        /// Input file (defaults to stdin)
        file: Option<PathBuf>,

        /// Remove unterminated tags instead of escaping them
        #[arg(long)]
        strip_invalid: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::WARN.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Render {
            view,
            views,
            opts,
            opts_file,
            template,
            no_markdown,
            output,
        } => {
            let args = commands::RenderArgs {
                view,
                views,
                opts,
                opts_file,
                template,
                no_markdown,
                output,
            };
            commands::render_view(&cli.config, args)
        }
        Commands::CloseTags {
            file,
            strip_invalid,
        } => commands::close_tags(&cli.config, file.as_deref(), strip_invalid),
    }
}
