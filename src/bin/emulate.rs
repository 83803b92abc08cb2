use clap::Parser;
use rv32ima_emu::cli::Args;
use rv32ima_emu::driver;
use tracing_subscriber::EnvFilter;

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match driver::run(args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!("{err}");
            std::process::exit(1);
        }
    }
}
