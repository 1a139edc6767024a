//! Headless Notifo widget: keeps a live, de-duplicated view of one user's
//! notifications and sends acknowledgements back through a single-flight
//! job queue.

pub mod cli;
pub mod config;
pub mod controller;
pub mod registration;
pub mod telemetry;
pub mod watch;

pub use config::{ConfigError, ConfigOverrides, Credentials, WidgetConfig};
pub use controller::{
    ConnectivityCallback, NotificationCallback, WidgetCallbacks, WidgetController,
};
pub use registration::{Registrar, RegistrationCache, RegistrationError};

use job_queue::JobQueue;
use tracing::info;

/// Returns the user token to connect with, registering the user first when
/// only an app-level API key is configured.
pub async fn resolve_user_token(
    config: &WidgetConfig,
    cache: Option<RegistrationCache>,
    queue: &JobQueue,
) -> Result<String, RegistrationError> {
    match &config.credentials {
        Credentials::UserToken(token) => Ok(token.clone()),
        Credentials::ApiKey(api_key) => {
            let registrar = Registrar::new(&config.api_url, api_key.as_str(), cache, queue.clone())?;
            let registered = registrar.register(config.register_request()).await?;
            info!(target: "notifo.widget", user_id = %registered.user_id, "using registered user");
            Ok(registered.user_token)
        }
    }
}
