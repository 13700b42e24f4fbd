use common::telemetry::{get_tracing_subscriber, init_tracing_subscriber};
use document_processing_worker::{
    configuration::get_configuration,
    startup::{cancel_on_shutdown_signal, Application},
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let tracing_subscriber = get_tracing_subscriber(
        "document_processing_worker".into(),
        "info".into(),
        std::io::stdout,
    );
    init_tracing_subscriber(tracing_subscriber);

    // Panics if the configuration can't be read
    let configuration = get_configuration().expect("Failed to read configuration.");

    let application = Application::build(configuration).await?;

    // Stops pulling new deliveries on shutdown, in-flight ones are finished
    let cancel_token = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown_signal(cancel_token.clone()));

    application.run_until_stopped(cancel_token).await?;

    Ok(())
}
