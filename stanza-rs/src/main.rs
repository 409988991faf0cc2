use std::io::Write;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stanza::cli::{self, Cli};

fn init_logging(verbose: u8) {
    // RUST_LOG wins over -v.
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        })
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn main() {
    let args = Cli::parse();
    init_logging(args.verbose);

    match cli::run(&args) {
        Ok(out) => {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = stdout.write_all(out.as_bytes()).and_then(|()| stdout.flush()) {
                eprintln!("stanza: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("stanza: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            std::process::exit(1);
        }
    }
}
