use clap::Parser;

#[tokio::main]
async fn main() {
    anipipectl::init_tracing();
    let cli = anipipectl::Cli::parse();
    if let Err(err) = anipipectl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
