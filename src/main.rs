/// To build a static binary against the TSS libraries:
/// ```
/// MOS_TRUST_BUILD_STATIC=1 cargo build --release --target=x86_64-unknown-linux-musl
/// ```
use eyre::Result;
use mos_trust::cli::Cli;
use std::env;

fn main() -> Result<()> {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, cli.log_level()),
    );
    env::set_var("TSS2_LOG", "all+NONE");
    cli.run()?;
    Ok(())
}
