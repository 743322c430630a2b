use std::process::ExitCode;
use std::sync::Arc;

use chatline::app::App;
use chatline::settings::SettingsStore;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr so they never interleave with streamed replies on stdout.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let store = SettingsStore::open_default();
    tracing::info!(path = ?store.config_path(), "loaded settings");

    let app = match App::new(Arc::new(store)) {
        Ok(app) => app,
        Err(error) => {
            eprintln!("chatline: {error}");
            return ExitCode::FAILURE;
        }
    };

    match app.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "chatline exited with an error");
            eprintln!("chatline: {error}");
            ExitCode::FAILURE
        }
    }
}
