//! Broker connection management
//!
//! Owns exactly one physical WebSocket connection: connect + handshake,
//! the single-threaded frame loop, and heartbeat monitoring. Credential
//! and identity hint travel as URL query parameters because the transport
//! negotiates before any header-bearing exchange is possible.
//!
//! This layer never reconnects. A dropped transport is reported to the
//! caller as a `CloseReason` so the session layer can reset its
//! subscription registry and state maps before any retry.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::protocol::{classify, ClientFrame, InboundFrame, ServerEvent};

/// Why a connection's frame loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Server closed the transport or the stream ended.
    ServerClose,
    /// Read or write failed mid-stream.
    TransportError(String),
    /// Our ping went unanswered past the pong deadline.
    PongTimeout,
    /// The session dropped its outbound sender: deliberate local close.
    LocalClose,
    /// The inbound consumer went away; nobody is reading events.
    ConsumerGone,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServerClose => write!(f, "server_close"),
            Self::TransportError(e) => write!(f, "transport_error: {}", e),
            Self::PongTimeout => write!(f, "pong_timeout"),
            Self::LocalClose => write!(f, "local_close"),
            Self::ConsumerGone => write!(f, "consumer_gone"),
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One live broker connection, post-handshake.
pub struct Connection {
    ws: WsStream,
    config: RealtimeConfig,
}

impl Connection {
    /// Open the transport and wait for the broker's explicit `connected`
    /// acknowledgment. Resolves only after the ack. A rejection or close
    /// before the ack is a `Handshake` error (fatal, never auto-retried);
    /// timeouts surface as retryable transport errors.
    pub async fn connect(
        config: &RealtimeConfig,
        endpoint: &str,
        credential: &str,
        identity_hint: Option<&str>,
    ) -> Result<Self, RealtimeError> {
        let url = build_connect_url(endpoint, credential, identity_hint)?;
        // Do not log the URL: it carries the credential.
        debug!(endpoint, "connecting to broker");

        let connect = connect_async(url.as_str());
        let (mut ws, response) = match timeout(config.connect_timeout(), connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(WsError::Http(resp))) => {
                return Err(RealtimeError::Handshake(format!(
                    "rejected with status {}",
                    resp.status()
                )))
            }
            Ok(Err(other)) => return Err(RealtimeError::Transport(other)),
            // A timeout is a network condition, not a rejection: retryable.
            Err(_) => return Err(timed_out("connect timed out before upgrade")),
        };
        debug!(status = %response.status(), "transport upgraded, waiting for handshake ack");

        match timeout(config.connect_timeout(), wait_for_ack(&mut ws)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(timed_out("no handshake ack within timeout")),
        }

        info!(endpoint, "broker handshake acknowledged");
        Ok(Self {
            ws,
            config: config.clone(),
        })
    }

    /// The connection's single-threaded event loop. All inbound frame
    /// handling and outbound sends serialize through here; classified
    /// events go out over the bounded inbound channel. Returns when the
    /// transport is done, for any reason.
    pub async fn run(
        self,
        mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
        inbound_tx: mpsc::Sender<InboundFrame>,
    ) -> CloseReason {
        let (mut sink, mut stream) = self.ws.split();
        let ping_interval = self.config.ping_interval();
        let pong_timeout = self.config.pong_timeout();

        let mut ping_timer = interval_at(Instant::now() + ping_interval, ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut awaiting_pong_since: Option<Instant> = None;

        loop {
            let pong_deadline = async {
                match awaiting_pong_since {
                    Some(since) => tokio::time::sleep_until(since + pong_timeout).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                frame = stream.next() => match frame {
                    None => return CloseReason::ServerClose,
                    Some(Err(e)) => return CloseReason::TransportError(e.to_string()),
                    Some(Ok(Message::Text(text))) => {
                        match classify(&text) {
                            Ok(inbound) => {
                                // Broker-level keepalive answers stay here.
                                if matches!(inbound.event, ServerEvent::Pong) {
                                    awaiting_pong_since = None;
                                    continue;
                                }
                                if inbound_tx.send(inbound).await.is_err() {
                                    return CloseReason::ConsumerGone;
                                }
                            }
                            // Per-frame isolation: drop and log, stay connected.
                            Err(e) => warn!(error = %e, "dropping unclassifiable frame"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            return CloseReason::TransportError(e.to_string());
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong_since = None;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "server closed connection");
                        return CloseReason::ServerClose;
                    }
                    Some(Ok(other)) => {
                        warn!("ignoring unexpected frame: {} bytes", other.len());
                    }
                },

                maybe_frame = outbound_rx.recv() => match maybe_frame {
                    Some(frame) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to encode outbound frame");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            return CloseReason::TransportError(e.to_string());
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return CloseReason::LocalClose;
                    }
                },

                _ = ping_timer.tick() => {
                    if awaiting_pong_since.is_none() {
                        // Broker-level keepalive; the broker answers with a
                        // `pong` event rather than a ws control frame.
                        let ping = match serde_json::to_string(&ClientFrame::Ping) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to encode ping frame");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(ping)).await {
                            return CloseReason::TransportError(e.to_string());
                        }
                        awaiting_pong_since = Some(Instant::now());
                    }
                }

                _ = pong_deadline => {
                    warn!("pong deadline missed, closing transport");
                    return CloseReason::PongTimeout;
                }
            }
        }
    }
}

/// Build the connect URL through a real parser: an endpoint without a
/// path gets `/` (a bare authority is not a valid request URI), existing
/// query pairs are preserved, and the credential is percent-encoded.
fn build_connect_url(
    endpoint: &str,
    credential: &str,
    identity_hint: Option<&str>,
) -> Result<Url, RealtimeError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| RealtimeError::Handshake(format!("invalid endpoint: {}", e)))?;

    url.query_pairs_mut().append_pair("token", credential);
    if let Some(role) = identity_hint {
        url.query_pairs_mut().append_pair("role", role);
    }
    Ok(url)
}

fn timed_out(context: &str) -> RealtimeError {
    RealtimeError::Transport(WsError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        context.to_string(),
    )))
}

async fn wait_for_ack(ws: &mut WsStream) -> Result<(), RealtimeError> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return match classify(&text) {
                    Ok(InboundFrame {
                        event: ServerEvent::Connected { session },
                        ..
                    }) => {
                        debug!(?session, "received connected ack");
                        Ok(())
                    }
                    // The first text frame must be the ack; anything else
                    // means the credential was not accepted.
                    _ => Err(RealtimeError::Handshake(format!(
                        "unexpected first frame: {}",
                        text.chars().take(120).collect::<String>()
                    ))),
                };
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(frame)) => {
                return Err(RealtimeError::Handshake(format!(
                    "closed during handshake: {:?}",
                    frame
                )))
            }
            Ok(_) => continue,
            Err(e) => return Err(RealtimeError::Transport(e)),
        }
    }
    Err(RealtimeError::Handshake(
        "connection ended before handshake ack".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url_normalizes_empty_path() {
        // A bare authority must gain a `/` to form a valid request URI.
        let url = build_connect_url("ws://127.0.0.1:9000", "tok", None).unwrap();
        assert_eq!(url.path(), "/");
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/?token=tok");
    }

    #[test]
    fn test_connect_url_preserves_existing_query_and_encodes() {
        let url = build_connect_url(
            "wss://live.example.com/ws?v=2",
            "a b+c",
            Some("teacher"),
        )
        .unwrap();
        assert_eq!(url.path(), "/ws");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("v".to_string(), "2".to_string())));
        assert!(pairs.contains(&("token".to_string(), "a b+c".to_string())));
        assert!(pairs.contains(&("role".to_string(), "teacher".to_string())));
    }

    #[test]
    fn test_connect_url_rejects_garbage_endpoint() {
        let err = build_connect_url("not a url", "tok", None).unwrap_err();
        assert!(matches!(err, RealtimeError::Handshake(_)));
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::ServerClose.to_string(), "server_close");
        assert_eq!(CloseReason::PongTimeout.to_string(), "pong_timeout");
        assert_eq!(
            CloseReason::TransportError("reset".to_string()).to_string(),
            "transport_error: reset"
        );
    }
}
