use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::{create_app, AppState};

/// The relay only ever binds loopback; it exists to give the embedded
/// player a same-origin view of local files and proxied upstreams.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Strip surrounding literal quotes, as produced by "copy as path".
pub fn strip_quotes(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.len() >= 3 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    }
}

/// Bound-server identity plus the route-builder helpers the caller uses to
/// hand playable URLs to the player.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub host: &'static str,
    pub port: u16,
}

impl ServerHandle {
    pub fn origin(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn local_video_url(&self, path: &str) -> String {
        format!(
            "{}/local-video/{}",
            self.origin(),
            urlencoding::encode(strip_quotes(path))
        )
    }

    pub fn subtitle_url(&self, path: &str) -> String {
        format!(
            "{}/subtitles/{}",
            self.origin(),
            urlencoding::encode(strip_quotes(path))
        )
    }

    pub fn manifest_url(&self, bvid: &str, cid: &str) -> String {
        format!("{}/manifest/bvid={}&cid={}.mpd", self.origin(), bvid, cid)
    }

    pub fn subtitle_convert_url(&self, remote_url: &str) -> String {
        format!(
            "{}/subtitle-convert/subtitle_url={}",
            self.origin(),
            urlencoding::encode(remote_url)
        )
    }

    pub fn proxy_url(&self, upstream: &str) -> crate::error::RelayResult<String> {
        crate::proxy::proxied_url(upstream, &self.origin())
    }
}

/// Owns the one listening instance for this process. Starting an already
/// started server is a no-op that returns the existing handle.
#[derive(Default)]
pub struct RelayServer {
    handle: OnceCell<ServerHandle>,
}

/// Probe whether anything is already answering HTTP on the port. A live
/// response means the port is taken (binding it would fail anyway); a
/// connect error means it is ours to claim.
async fn port_is_free(port: u16) -> bool {
    let client = reqwest::Client::new();
    client
        .get(format!("http://{LOOPBACK_HOST}:{port}/"))
        .send()
        .await
        .is_err()
}

impl RelayServer {
    pub fn new() -> Self {
        Self {
            handle: OnceCell::new(),
        }
    }

    /// Bind and start serving, memoizing the handle. A requested port that
    /// is already occupied falls back to an OS-assigned ephemeral port; a
    /// bind failure on the chosen port is fatal and propagates.
    pub async fn start(&self, preferred_port: Option<u16>) -> anyhow::Result<&ServerHandle> {
        self.handle
            .get_or_try_init(|| async {
                let port = match preferred_port {
                    Some(p) if p != 0 && port_is_free(p).await => p,
                    Some(p) if p != 0 => {
                        info!("Port {} is already in use, falling back to an ephemeral port", p);
                        0
                    }
                    _ => 0,
                };

                let listener = TcpListener::bind((LOOPBACK_HOST, port)).await?;
                let handle = ServerHandle {
                    host: LOOPBACK_HOST,
                    port: listener.local_addr()?.port(),
                };

                let app = create_app(AppState::new(handle.origin()));
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).await {
                        error!("Relay server exited: {}", e);
                    }
                });

                info!("Relay server listening on {}", handle.origin());
                Ok(handle)
            })
            .await
    }

    /// The handle of an already started server, if any.
    pub fn handle(&self) -> Option<&ServerHandle> {
        self.handle.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_copy_as_path_quotes() {
        assert_eq!(strip_quotes("\"C:\\clips\\talk.mp4\""), "C:\\clips\\talk.mp4");
        assert_eq!(strip_quotes("/home/u/talk.mp4"), "/home/u/talk.mp4");
        assert_eq!(strip_quotes("  \"/a b/c.mp4\"  "), "/a b/c.mp4");
        assert_eq!(strip_quotes("\"\""), "\"\"");
    }

    #[test]
    fn url_builders_target_loopback_routes() {
        let handle = ServerHandle {
            host: LOOPBACK_HOST,
            port: 43210,
        };
        assert_eq!(
            handle.local_video_url("/media/a clip.mp4"),
            "http://127.0.0.1:43210/local-video/%2Fmedia%2Fa%20clip.mp4"
        );
        assert_eq!(
            handle.manifest_url("BV1xx411c7md", "111"),
            "http://127.0.0.1:43210/manifest/bvid=BV1xx411c7md&cid=111.mpd"
        );
        assert!(handle
            .subtitle_url("\"/subs/movie.srt\"")
            .ends_with("/subtitles/%2Fsubs%2Fmovie.srt"));
    }

    #[tokio::test]
    async fn starting_twice_returns_the_same_handle() {
        let relay = RelayServer::new();
        let first = relay.start(None).await.unwrap().clone();
        let second = relay.start(Some(1)).await.unwrap().clone();
        assert_eq!(first.port, second.port);
        assert_eq!(first.origin(), second.origin());
    }
}
