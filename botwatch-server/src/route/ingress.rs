use axum::{
    extract::{
        OriginalUri, Query, State, WebSocketUpgrade,
        rejection::QueryRejection,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    http::{HeaderMap, HeaderName, header},
    response::Response,
};
use botwatch_proto::msg::{ConnectParams, ConnectionEstablished};
use futures_util::SinkExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span};

use crate::{
    AppState,
    lifecycle::{self, CloseSummary, LogMode, RequestDetails},
    observer,
    session::{self, Session},
};

/// Websocket endpoint for bots.
///
/// Every upgrade is accepted: there is no origin, sub-protocol or credential
/// check. This is a test harness policy, real endpoints must not copy it.
pub async fn ingress_ws(
    State(state): State<AppState>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let params = match query {
        Ok(Query(pairs)) => ConnectParams::from_pairs(pairs),
        Err(e) => {
            debug!(%e, "ignoring malformed query string");
            ConnectParams::default()
        }
    };

    let request = RequestDetails {
        uri: uri.to_string(),
        origin: header_value(&headers, header::ORIGIN),
        user_agent: header_value(&headers, header::USER_AGENT),
    };

    let bot_id = session::label(params.bot_id.as_deref()).to_owned();
    ws.on_upgrade(move |socket| {
        handle_socket(socket, state, params, request).instrument(info_span!("bot_ws", bot_id))
    })
}

fn header_value(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    params: ConnectParams,
    request: RequestDetails,
) {
    let _tracker_token = state.ws_graceful_shutdown.tracker.token();
    serve_session(socket, &state, params, &request).await;
}

/// Run one session from greeting to close and hand back its final state.
pub(crate) async fn serve_session(
    socket: WebSocket,
    state: &AppState,
    params: ConnectParams,
    request: &RequestDetails,
) -> (Session, CloseSummary) {
    let session = Session::new(params, Instant::now());
    lifecycle::connection_opened(&session, request, state.log_mode);

    let mut controller = IngressController {
        ws: socket,
        cancellation_token: state.ws_graceful_shutdown.token.child_token(),
        log_mode: state.log_mode,
        session,
    };

    let close = controller.run().await;
    controller.ws.close().await.ok();
    lifecycle::connection_closed(&controller.session, &close);

    (controller.session, close)
}

struct IngressController {
    ws: WebSocket,
    cancellation_token: CancellationToken,
    log_mode: LogMode,
    session: Session,
}

impl IngressController {
    async fn run(&mut self) -> CloseSummary {
        if let Err(e) = self.greet().await {
            return self.fail(e).await;
        }

        loop {
            match self.next().await {
                Ok(None) => {}
                Ok(Some(close)) => return close,
                Err(e) => return self.fail(e).await,
            }
        }
    }

    async fn greet(&mut self) -> Result<(), SessionError> {
        let greeting = ConnectionEstablished::new(self.session.bot_id.clone());
        let text = serde_json::to_string(&greeting)?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close<T: IntoCloseFrame>(&mut self, msg: T) -> anyhow::Result<()> {
        let msg = msg.into_close_frame();
        if let Some(CloseFrame { code, ref reason }) = msg {
            debug!(code, %reason, "closing websocket");
        }
        self.ws.send(Message::Close(msg)).await?;
        Ok(())
    }

    async fn fail(&mut self, err: SessionError) -> CloseSummary {
        match &err {
            SessionError::Socket(e) => lifecycle::socket_error(&self.session, e),
            SessionError::Encode(e) => error!(error = %e, "failed to encode greeting"),
            SessionError::Shutdown => {}
        }

        let close = err.close_summary();
        self.close(err).await.ok();
        close
    }

    /// `Ok(Some(_))` once the peer has gone away.
    async fn next(&mut self) -> Result<Option<CloseSummary>, SessionError> {
        tokio::select! {
            msg = self.ws.recv() => match msg {
                Some(msg) => Ok(self.process_msg(msg?)),
                // stream ended without a close frame
                None => Ok(Some(CloseSummary {
                    code: close_code::ABNORMAL,
                    reason: String::new(),
                })),
            },
            _ = self.cancellation_token.cancelled() => Err(SessionError::Shutdown),
        }
    }

    fn process_msg(&mut self, msg: Message) -> Option<CloseSummary> {
        let payload: &[u8] = match &msg {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(bytes) => bytes.as_ref(),
            Message::Close(Some(CloseFrame { code, reason })) => {
                return Some(CloseSummary {
                    code: *code,
                    reason: reason.as_str().to_owned(),
                });
            }
            Message::Close(None) => {
                return Some(CloseSummary {
                    code: close_code::STATUS,
                    reason: String::new(),
                });
            }
            // pings are answered by axum
            Message::Ping(_) | Message::Pong(_) => return None,
        };

        let observation = observer::observe(&mut self.session, payload, Instant::now());
        lifecycle::observation(&observation, self.log_mode);
        None
    }
}

trait IntoCloseFrame {
    fn into_close_frame(self) -> Option<CloseFrame>;
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("server is shutting down")]
    Shutdown,
    #[error("websocket error: {0}")]
    Socket(#[from] axum::Error),
    #[error("failed to encode greeting: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SessionError {
    fn close_summary(&self) -> CloseSummary {
        let (code, reason) = match self {
            SessionError::Shutdown => (close_code::AWAY, "server shutting down"),
            SessionError::Socket(_) => (close_code::ABNORMAL, ""),
            SessionError::Encode(_) => (close_code::ERROR, "internal error"),
        };
        CloseSummary {
            code,
            reason: reason.to_owned(),
        }
    }
}

impl IntoCloseFrame for SessionError {
    fn into_close_frame(self) -> Option<CloseFrame> {
        match self {
            SessionError::Shutdown => Some(CloseFrame {
                code: close_code::AWAY,
                reason: "server shutting down".into(),
            }),
            // the socket is already broken
            SessionError::Socket(_) => None,
            SessionError::Encode(e) => Some(CloseFrame {
                code: close_code::ERROR,
                reason: format!("internal error: {e}").into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use axum::{Router, routing::get};
    use botwatch_proto::{AUDIO_EVENT, msg::GREETING_TYPE};
    use bytes::Bytes;
    use futures_util::StreamExt;
    use serde_json::json;
    use tokio::{io::AsyncWriteExt, net::TcpListener, sync::mpsc, time::timeout};
    use tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{
            self,
            protocol::{CloseFrame as ClientCloseFrame, frame::coding::CloseCode},
        },
    };

    use super::*;

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
    type Finished = mpsc::UnboundedReceiver<(Session, CloseSummary)>;

    async fn spawn_app(state: AppState) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, crate::app(state)).await.ok();
        });
        addr
    }

    /// Same upgrade path as the real router, but reports each finished session.
    async fn spawn_recording(state: AppState) -> (SocketAddr, Finished) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router::new().route(
            "/",
            get(
                move |Query(pairs): Query<Vec<(String, String)>>, ws: WebSocketUpgrade| {
                    let tx = tx.clone();
                    let state = state.clone();
                    let params = ConnectParams::from_pairs(pairs);
                    async move {
                        ws.on_upgrade(move |socket| async move {
                            let request = RequestDetails::default();
                            let finished = serve_session(socket, &state, params, &request).await;
                            tx.send(finished).ok();
                        })
                    }
                },
            ),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        (addr, rx)
    }

    async fn connect(addr: SocketAddr, query: &str) -> (Client, ConnectionEstablished) {
        let (mut client, _) = connect_async(format!("ws://{addr}/{query}"))
            .await
            .unwrap();

        let greeting = match client.next().await.unwrap().unwrap() {
            tungstenite::Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected greeting, got {other:?}"),
        };
        (client, greeting)
    }

    async fn close(mut client: Client, reason: &str) {
        client
            .close(Some(ClientCloseFrame {
                code: CloseCode::Normal,
                reason: reason.into(),
            }))
            .await
            .unwrap();
        while let Some(Ok(_)) = client.next().await {}
    }

    async fn finished(rx: &mut Finished) -> (Session, CloseSummary) {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn greeting_echoes_bot_id() {
        let addr = spawn_app(AppState::new(LogMode::Detailed)).await;

        let (client, greeting) = connect(addr, "?bot_id=bot-7&connection_type=recall").await;

        assert_eq!(greeting.kind, GREETING_TYPE);
        assert_eq!(greeting.bot_id.as_deref(), Some("bot-7"));
        close(client, "done").await;
    }

    #[tokio::test]
    async fn repeated_query_keys_keep_first_value() {
        let addr = spawn_app(AppState::new(LogMode::Minimal)).await;

        let (client, greeting) =
            connect(addr, "?bot_id=bot-9&connection_type=recall&bot_id=other").await;

        assert_eq!(greeting.bot_id.as_deref(), Some("bot-9"));
        close(client, "").await;
    }

    #[tokio::test]
    async fn socket_error_ends_session_as_abnormal() {
        let (addr, mut rx) = spawn_recording(AppState::new(LogMode::Detailed)).await;
        let (mut client, _) = connect(addr, "?bot_id=broken&bot_id=ignored").await;

        // masked, empty frame with the reserved opcode 0x3
        let stream = client.get_mut();
        stream.write_all(&[0x83, 0x80, 0, 0, 0, 0]).await.unwrap();
        stream.flush().await.unwrap();
        while let Some(Ok(_)) = client.next().await {}

        let (session, summary) = finished(&mut rx).await;
        assert_eq!(session.bot_label(), "broken");
        assert_eq!(session.message_count, 0);
        assert_eq!(summary.code, close_code::ABNORMAL);
        assert_eq!(summary.reason_label(), "No reason provided");
    }

    #[tokio::test]
    async fn close_totals_match_received_frames() {
        let (addr, mut rx) = spawn_recording(AppState::new(LogMode::Detailed)).await;
        let (mut client, _) = connect(addr, "?bot_id=bot-1").await;

        let audio = json!({
            "event": AUDIO_EVENT,
            "data": { "data": { "buffer": "AAECAw==", "participant": { "id": 1 } } },
        })
        .to_string();

        for i in 1..=12 {
            let text = if i == 10 {
                audio.clone()
            } else {
                json!({ "event": "transcript.data", "seq": i }).to_string()
            };
            client
                .send(tungstenite::Message::Text(text.into()))
                .await
                .unwrap();
        }
        client
            .send(tungstenite::Message::Binary(Bytes::from_static(&[0, 1, 2])))
            .await
            .unwrap();
        close(client, "done").await;

        let (session, summary) = finished(&mut rx).await;
        assert_eq!(session.bot_id.as_deref(), Some("bot-1"));
        assert_eq!(session.message_count, 13);
        assert_eq!(session.audio_message_count, 1);
        assert_eq!(
            summary,
            CloseSummary {
                code: close_code::NORMAL,
                reason: "done".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn new_session_for_same_bot_starts_at_zero() {
        let (addr, mut rx) = spawn_recording(AppState::new(LogMode::Detailed)).await;

        for frames in [5, 2] {
            let (mut client, _) = connect(addr, "?bot_id=repeat").await;
            for _ in 0..frames {
                client
                    .send(tungstenite::Message::Text("{}".into()))
                    .await
                    .unwrap();
            }
            close(client, "").await;

            let (session, summary) = finished(&mut rx).await;
            assert_eq!(session.message_count, frames);
            assert_eq!(summary.reason_label(), "No reason provided");
        }
    }

    #[tokio::test]
    async fn shutdown_closes_open_sessions() {
        let state = AppState::new(LogMode::Detailed);
        let (addr, mut rx) = spawn_recording(state.clone()).await;
        let (mut client, _) = connect(addr, "?bot_id=bot-2").await;

        state.ws_graceful_shutdown.token.cancel();

        match client.next().await.unwrap().unwrap() {
            tungstenite::Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close frame, got {other:?}"),
        }

        let (_, summary) = finished(&mut rx).await;
        assert_eq!(summary.code, close_code::AWAY);
        assert_eq!(summary.reason, "server shutting down");
    }
}
