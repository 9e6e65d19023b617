use newsletter_dispatch::config::get_configuration;
use newsletter_dispatch::startup::{Application, StartupError};
use newsletter_dispatch::telemetry::{get_subscriber, init_subscriber};

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let subscriber = get_subscriber(
        String::from("newsletter_dispatch"),
        String::from("info"),
        std::io::stdout,
    );
    init_subscriber(subscriber);

    let config = get_configuration().expect("Failed to read configuration.");
    let application = Application::build(config).await?;

    application.run_until_stop().await?;
    Ok(())
}
