//! artiflow CLI entry point.

use std::process::ExitCode;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    let cli = artiflow::cli::parse_cli();

    // RUST_LOG > --log-level > "info"
    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr))
                                  .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
                                  .init();

    let code = artiflow::cli::run_with_cli(cli);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
