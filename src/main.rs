use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;

mod output;
mod telemetry;
mod upload;

#[derive(Parser)]
#[command(name = "omnipub", about = "Bulk-upload article JSON files to the Omnipub API")]
struct Cli {
    /// Emit a single JSON envelope to stdout; logs go to stderr
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(flatten)]
    upload: upload::UploadCmd,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    telemetry::config::set_json_mode(cli.json);

    // initialize logging/tracing (stderr). Respect RUST_LOG and OMNIPUB_LOG_FORMAT
    telemetry::config::init_tracing();

    let ct = CancellationToken::new();
    let on_signal = ct.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling in-flight uploads");
            on_signal.cancel();
        }
    });

    upload::run(cli.upload, ct).await
}
