use tracing_subscriber::fmt::init;

use verselearning_api::{
    config::Config,
    services::{
        email_service::EmailService, notification_service::NotificationService,
        reminder_worker::ReminderWorker, AppState,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();

    let config = Config::load().expect("Failed to load configuration");

    let mongo_client = mongodb::Client::with_uri_str(&config.mongo_uri)
        .await
        .expect("Failed to connect to MongoDB");

    let redis_client =
        redis::Client::open(config.redis_uri.clone()).expect("Failed to create Redis client");

    let app_state = AppState::new(config.clone(), mongo_client, redis_client)
        .await
        .expect("Failed to initialize app state");

    let notification = NotificationService::new(
        app_state.mongo.clone(),
        EmailService::new(config.mail.clone()),
        config.play_base_url.clone(),
    );

    let worker = ReminderWorker::new(notification, config);

    worker.run().await?;

    Ok(())
}
