use clap::Parser;
use llama_cli::{run_bench, Cli, Command};

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Bench(args) => match run_bench(&args) {
            Ok(report) => {
                println!("{}", report.summary);
                for failure in &report.failures {
                    eprintln!("skipped: {failure}");
                }
                if let Some(err) = report.aborted {
                    eprintln!("error: {err}");
                    std::process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        },
    }
}
