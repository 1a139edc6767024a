use std::sync::Arc;
use std::time::Duration;

use notifo_model::ConnectionMode;
use url::Url;

use crate::connection::Connection;
use crate::error::{ConnectionError, ConnectionResult};
use crate::polling::{HttpPollApi, PollingConnection};
use crate::socket::{SocketConnection, WebSocketConnector};

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(5_000);

const HUB_PATH: &str = "hub";

/// What the factory needs to know to build a transport.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub api_url: Url,
    /// User token or app API key, sent as `X-ApiKey`.
    pub api_key: String,
    pub mode: ConnectionMode,
    pub polling_interval: Duration,
}

impl ConnectionOptions {
    pub fn new(api_url: Url, api_key: impl Into<String>) -> Self {
        Self {
            api_url,
            api_key: api_key.into(),
            mode: ConnectionMode::default(),
            polling_interval: DEFAULT_POLLING_INTERVAL,
        }
    }

    pub fn with_mode(mut self, mode: ConnectionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }
}

/// Builds the transport selected by `options.mode`. Nothing is started.
pub fn build_connection(options: &ConnectionOptions) -> ConnectionResult<Arc<dyn Connection>> {
    let connection: Arc<dyn Connection> = match options.mode {
        ConnectionMode::Polling => {
            let api = HttpPollApi::new(&options.api_url, &options.api_key)?;
            Arc::new(PollingConnection::new(
                Arc::new(api),
                options.polling_interval,
            ))
        }
        ConnectionMode::SignalR | ConnectionMode::SignalRSockets => {
            let hub_url = join_api(&options.api_url, HUB_PATH)?;
            let negotiate = options.mode == ConnectionMode::SignalR;
            let connector = WebSocketConnector::new(hub_url, &options.api_key, negotiate);
            Arc::new(SocketConnection::new(Arc::new(connector)))
        }
    };
    Ok(connection)
}

/// Appends `path` to the API base url, keeping any path prefix the base has.
///
/// A base with a query or fragment is rejected since neither belongs to an
/// endpoint prefix.
pub fn join_api(base: &Url, path: &str) -> ConnectionResult<Url> {
    if base.query().is_some() || base.fragment().is_some() {
        return Err(ConnectionError::InvalidUrl(format!(
            "{base}: api url must not carry a query or fragment"
        )));
    }
    let mut segments = path
        .trim()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .peekable();
    if segments.peek().is_none() {
        return Err(ConnectionError::InvalidUrl("endpoint path must not be empty".into()));
    }

    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ConnectionError::InvalidUrl(format!("{base}: cannot be a base")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
