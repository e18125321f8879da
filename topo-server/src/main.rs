//! Binary entrypoint for `topo-coordinator`.

mod app;
mod console;
mod itc;
mod worker;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = app::run() {
        eprintln!("failed to start topo-coordinator: {err}");
        std::process::exit(1);
    }
}
