//! Read and expand templates from framed JSON requests on stdin.
//!
//! Input documents are separated by `^---` lines:
//! `{"batchId": "…", "schema": "<yaml>", "templates": [{"type": "…",
//! "content": "<yaml>"}, …]}`. One response object is written per
//! template, each followed by `---`.

use std::io::{stdin, stdout, BufReader};

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "templates", version, about = "Read and expand workflow templates from stdin")]
struct Args {
    /// Indent responses with two spaces.
    #[arg(long)]
    pretty: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut input = BufReader::new(stdin().lock());
    let mut output = stdout().lock();
    templates_cli::process_stream(
        &mut input,
        &mut output,
        args.pretty,
        templates_cli::handle_templates_document,
    )?;
    Ok(())
}
