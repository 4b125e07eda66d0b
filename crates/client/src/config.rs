use http::Uri;
use relaytun_common::{Error, TunnelSettings};
use url::Url;

pub const TUNNEL_PATH: &str = "api/v1/tunnel";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the hub's registration listener, `ws(s)://` or `http(s)://`.
    pub relay_url: Url,
    pub node_id: String,
    /// Local service tunnelled traffic is forwarded to.
    pub local_url: Uri,
    pub settings: TunnelSettings,
}

impl ClientConfig {
    pub fn new(relay_url: Url, node_id: impl Into<String>, local_url: Uri) -> Self {
        ClientConfig {
            relay_url,
            node_id: node_id.into(),
            local_url,
            settings: TunnelSettings::default(),
        }
    }

    /// Registration endpoint of this node on the hub.
    pub fn tunnel_url(&self) -> Result<Url, Error> {
        let mut url = self.relay_url.clone();

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(Error::Transport(format!(
                    "unsupported relay URL scheme `{}`",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| Error::Transport(format!("cannot use {} as relay URL", self.relay_url)))?;

        let path = format!("{}/{}", url.path().trim_end_matches('/'), TUNNEL_PATH);
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("node_id", &self.node_id);

        Ok(url)
    }
}
