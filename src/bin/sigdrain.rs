use clap::Parser;
use log::LevelFilter;

use sigdrain::cli::{Cli, OutputFormat};
use sigdrain::config::RunConfig;
use sigdrain::orchestrator::Orchestrator;
use sigdrain::task::Task;
use sigdrain::wordcount::WordCount;

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity flags
    let log_level = if cli.quiet {
        LevelFilter::Error
    } else {
        match cli.verbosity {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_target(false)
        .format_timestamp(None)
        .init();

    // Build run config from environment, then apply CLI overrides
    let config = RunConfig::from_env().with_overrides(
        cli.workers,
        cli.tasks,
        cli.queue_capacity,
        cli.status_interval_ms,
    );

    let tasks = (1..=config.tasks)
        .map(|i| Task::with_label(format!("task-{}", i), WordCount::new(&cli.input)))
        .collect();

    let report = match Orchestrator::new(config).run(tasks) {
        Ok(report) => report,
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(-1);
        }
    };

    match cli.format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => match report.to_json() {
            Ok(json) => println!("{}", json),
            Err(err) => {
                log::error!("couldn't serialize report: {}", err);
                std::process::exit(1);
            }
        },
    }
}
