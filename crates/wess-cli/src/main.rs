use clap::Parser;
use wess_cli::{config, exit_code, init_logging, run, Cli};

fn main() {
    init_logging();
    let cli = Cli::parse();

    let config = match config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(4);
        }
    };

    let workers = config.workers.max(1);
    let executor = match task_executor::Executor::new_owned(workers, workers) {
        Ok(e) => e,
        Err(e) => {
            log::error!("failed to start runtime: {e}");
            std::process::exit(4);
        }
    };

    let result = executor.block_on(run::dispatch(cli.command, config, executor.to_borrowed()));
    if let Err(ref e) = result {
        log::error!("{e}");
    }
    executor.shutdown(std::time::Duration::from_secs(5));
    std::process::exit(exit_code(&result));
}
