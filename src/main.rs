use conductor::cli;

fn main() -> anyhow::Result<()> {
    // The sandbox helper re-execs this same binary with a hidden marker
    // argument. Intercept it before building a tokio runtime: the helper
    // loop is synchronous and must never return.
    if let Some(socket_path) = conductor::sandbox::helper::requested_socket_path() {
        return conductor::sandbox::helper::run_helper_main(&socket_path);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(cli::run())
}
