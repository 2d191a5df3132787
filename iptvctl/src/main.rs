use clap::Parser;

fn main() {
    let cli = iptvctl::Cli::parse();
    if let Err(err) = iptvctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
