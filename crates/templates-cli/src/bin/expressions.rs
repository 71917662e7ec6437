//! Evaluate expressions from framed JSON requests on stdin.
//!
//! Input documents are separated by `^---` lines:
//! `{"batchId": "…", "context": {name: value, …}, "expressions": ["…"]}`.
//! One response object is written per expression, each followed by `---`.

use std::io::{stdin, stdout, BufReader};

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "expressions", version, about = "Evaluate workflow expressions from stdin")]
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
        templates_cli::handle_expressions_document,
    )?;
    Ok(())
}
