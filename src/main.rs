// src/main.rs

use marketdag::{cli, logging, run, RunOutcome};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(outcome) if outcome.is_success() => {}
        Ok(_) => std::process::exit(1),
        Err(err) => {
            eprintln!("marketdag error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<RunOutcome> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args).await
}
