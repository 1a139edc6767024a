use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{ConnectionError, ConnectionResult};

const WEB_SOCKETS: &str = "WebSockets";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailableTransport {
    transport: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    available_transports: Vec<AvailableTransport>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Step {
    Redirect {
        url: String,
        access_token: Option<String>,
    },
    Connect {
        connection_id: String,
    },
}

impl NegotiateResponse {
    fn step(self) -> ConnectionResult<Step> {
        if let Some(error) = self.error {
            return Err(ConnectionError::Negotiate(error));
        }
        if let Some(url) = self.url {
            return Ok(Step::Redirect {
                url,
                access_token: self.access_token,
            });
        }
        if !self
            .available_transports
            .iter()
            .any(|t| t.transport.eq_ignore_ascii_case(WEB_SOCKETS))
        {
            return Err(ConnectionError::Negotiate(
                "server does not offer the WebSockets transport".into(),
            ));
        }
        self.connection_token
            .or(self.connection_id)
            .map(|connection_id| Step::Connect { connection_id })
            .ok_or_else(|| ConnectionError::Negotiate("response carries no connection id".into()))
    }
}

/// Where to open the socket after negotiation.
#[derive(Debug)]
pub(crate) struct Negotiated {
    pub hub_url: Url,
    pub connection_id: String,
    pub access_token: String,
}

/// Negotiates a connection id with the hub, following at most one redirect.
pub(crate) async fn negotiate(
    http: &reqwest::Client,
    hub_url: &Url,
    api_key: &str,
) -> ConnectionResult<Negotiated> {
    let mut hub_url = hub_url.clone();
    let mut access_token = api_key.to_string();
    let mut redirected = false;

    loop {
        let res = http
            .post(negotiate_url(&hub_url)?)
            .header("X-ApiKey", api_key)
            .bearer_auth(&access_token)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ConnectionError::UnexpectedStatus { status, body });
        }

        let response: NegotiateResponse = serde_json::from_slice(&res.bytes().await?)?;
        match response.step()? {
            Step::Connect { connection_id } => {
                debug!(target: "notifo.hub", %hub_url, "negotiated hub connection");
                return Ok(Negotiated {
                    hub_url,
                    connection_id,
                    access_token,
                });
            }
            Step::Redirect { .. } if redirected => {
                return Err(ConnectionError::Negotiate("redirected more than once".into()));
            }
            Step::Redirect {
                url,
                access_token: token,
            } => {
                debug!(target: "notifo.hub", %url, "following negotiate redirect");
                hub_url = Url::parse(&url)
                    .map_err(|err| ConnectionError::InvalidUrl(format!("{url}: {err}")))?;
                if let Some(token) = token {
                    access_token = token;
                }
                redirected = true;
            }
        }
    }
}

pub(crate) fn negotiate_url(hub_url: &Url) -> ConnectionResult<Url> {
    let mut url = hub_url.clone();
    url.path_segments_mut()
        .map_err(|_| ConnectionError::InvalidUrl(format!("{hub_url}: cannot be a base")))?
        .pop_if_empty()
        .push("negotiate");
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

/// Turns the hub url into the WebSocket endpoint, carrying the connection id
/// (when negotiated) and the access token as query parameters.
pub(crate) fn socket_url(
    hub_url: &Url,
    connection_id: Option<&str>,
    access_token: &str,
) -> ConnectionResult<Url> {
    let scheme = match hub_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectionError::InvalidUrl(format!(
                "unsupported scheme `{other}` for hub url {hub_url}"
            )))
        }
    };
    let mut url = hub_url.clone();
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidUrl(format!("cannot use {scheme} for {hub_url}")))?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(id) = connection_id {
            query.append_pair("id", id);
        }
        query.append_pair("access_token", access_token);
    }
    Ok(url)
}
