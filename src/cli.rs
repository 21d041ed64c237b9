use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "medtrace")]
#[command(about = "🩺 medtrace - regulatory artifacts from medical-device source code")]
#[command(long_about = "medtrace analyzes C and JavaScript medical-device source trees and derives features,
user and software requirements, an ISO 14971 risk register, a traceability matrix and test outlines.
A locally hosted language model is used when configured; every stage falls back to heuristics otherwise.

QUICK START:
  medtrace config --provider local-server --model llama3.1:8b   # Point at a local Ollama/OpenAI-compatible server
  medtrace analyze ./firmware --output ./artifacts              # Analyze and write every export

EXAMPLES:
  medtrace analyze ./pump --file src/dose.c --file src/alarm.c --description \"Insulin pump\"
  medtrace analyze ./pump --format markdown --no-cache
  medtrace config --show
  medtrace config --validate")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the analysis pipeline on a project directory")]
    #[command(long_about = "Run the full pipeline: ingest, parse, extract features, derive requirements,
identify hazards, build the risk register, outline tests and build the traceability matrix.

Results for an unchanged project are served from the cache unless --no-cache is given.
Press Ctrl-C to cancel; the run stops at the next stage boundary.

OUTPUT FILES (with --output):
  features.json, requirements.json, risk_register.csv, risk_register.json,
  traceability.csv, traceability.json, test_cases.txt/.json/.xml/.csv,
  analysis.json and report.md")]
    Analyze {
        #[arg(help = "Project root directory")]
        path: PathBuf,

        #[arg(short, long, help = "Analyze only this file (relative to the project root); repeatable", action = clap::ArgAction::Append)]
        file: Vec<PathBuf>,

        #[arg(short, long, help = "Short description of the device, used as context for the model")]
        description: Option<String>,

        #[arg(short, long, help = "Directory to write exported artifacts to")]
        output: Option<PathBuf>,

        #[arg(long, help = "Summary format printed to the console", value_enum, default_value = "markdown")]
        format: OutputFormat,

        #[arg(long, help = "Ignore cached results and analyze afresh")]
        no_cache: bool,
    },

    #[command(about = "Show or change configuration")]
    #[command(long_about = "Manage ~/.medtrace/config.yml.

EXAMPLES:
  medtrace config --provider llamacpp --base-url http://localhost:8080
  medtrace config --provider local-server --model llama3.1:8b
  medtrace config --show
  medtrace config --validate
  medtrace config --test")]
    Config {
        #[arg(short, long, help = "LLM provider", value_enum)]
        provider: Option<ProviderArg>,

        #[arg(short, long, help = "Model name served by the local server")]
        model: Option<String>,

        #[arg(long, help = "Base URL of the LLM server")]
        base_url: Option<String>,

        #[arg(long, help = "API key for servers that require one")]
        api_key: Option<String>,

        #[arg(long, help = "Display current configuration values")]
        show: bool,

        #[arg(long, help = "Validate configuration settings")]
        validate: bool,

        #[arg(long, help = "Check that the configured LLM backend is reachable")]
        test: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Markdown,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderArg {
    None,
    LocalServer,
    Llamacpp,
    Mock,
}
