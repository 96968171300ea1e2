use std::process;

use tracing_subscriber::EnvFilter;

use talm::cli::{self, format_classified};

/// Log filter for `-v` count, unless `RUST_LOG` is set. `DEBUG_TUI` turns on
/// wizard tracing either way.
fn env_filter(verbose: u8) -> anyhow::Result<EnvFilter> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if std::env::var_os("DEBUG_TUI").is_some() {
        filter = filter.add_directive("talm::wizard=trace".parse()?);
    }
    Ok(filter)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let invocation = match cli::parse_from(std::env::args_os()) {
        Ok(invocation) => invocation,
        Err(e) => e.exit(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(invocation.global().verbose)?)
        .with_writer(std::io::stderr)
        .init();

    match cli::run(invocation).await {
        Ok(output) => {
            print!("{output}");
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", format_classified(&e));
            process::exit(e.exit_code());
        }
    }
}
