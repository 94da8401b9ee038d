//! # Relay WebSocket Handler
//!
//! One actor per client connection on `/ws`.
//!
//! ## Protocol:
//! - **Client → Server, binary**: fixed-size audio frames (`[timestamp][flags][pcm]`)
//! - **Client → Server, text**: control messages
//!   (`{"type": "tts_start" | "tts_stop" | "clear_history" | "set_speed", ...}`)
//! - **Server → Client, text**: stage events and control replies, one JSON
//!   object per message, in the order the backend produced them
//!
//! ## Lifecycle:
//! 1. **Connect**: a session is opened in the store under a fresh `client_<uuid>` id
//! 2. **Stream**: frames are decoded and handed to the dispatcher; bad frames are dropped
//! 3. **Heartbeat**: the server pings every 30s and closes the socket after 60s of silence
//! 4. **Disconnect**: the session and its buffer are released; in-flight jobs finish unobserved

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audio::frame::FrameCodec;
use crate::backend::ControlMessage;
use crate::pipeline::events::{EventSink, ServerMessage};
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound message pushed into a connection's actor.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Deliver(pub ServerMessage);

/// Event sink backed by a socket actor's mailbox.
pub struct SocketSink {
    recipient: Recipient<Deliver>,
}

impl EventSink for SocketSink {
    fn deliver(&self, message: ServerMessage) -> bool {
        if !self.recipient.connected() {
            return false;
        }
        self.recipient.do_send(Deliver(message));
        true
    }
}

/// Parse a text frame into a control message, or the error to send back.
pub fn parse_control(text: &str) -> Result<ControlMessage, ServerMessage> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ServerMessage::error("Invalid JSON format"))?;

    serde_json::from_value::<ControlMessage>(value.clone()).map_err(|_| {
        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("<missing>");
        ServerMessage::error(format!("Unsupported control message: {}", kind))
    })
}

pub struct RelaySocket {
    session_id: String,
    state: web::Data<AppState>,
    codec: FrameCodec,
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let frame_samples = state.get_config().protocol.frame_samples;
        Self {
            session_id: format!("client_{}", uuid::Uuid::new_v4()),
            state,
            codec: FrameCodec::new(frame_samples),
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(session_id = %self.session_id, error = %e, "Failed to serialize outbound event"),
        }
    }

    fn handle_frame(&mut self, data: &[u8]) {
        let frame = match self.codec.decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    expected = self.codec.expected_size(),
                    actual = data.len(),
                    "Dropping malformed frame: {}", e
                );
                self.state.record_rejected_frame();
                return;
            }
        };

        if let Err(e) = self.state.dispatcher.on_frame(&self.session_id, &frame, Instant::now()) {
            warn!(session_id = %self.session_id, error = %e, "Frame not recorded");
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match parse_control(text) {
            Ok(control) => {
                if let Err(e) = self.state.dispatcher.on_control(&self.session_id, control) {
                    warn!(session_id = %self.session_id, error = %e, "Control message not applied");
                }
            }
            Err(reply) => {
                debug!(session_id = %self.session_id, "Rejected text message");
                self.send(ctx, &reply);
            }
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let sink = Arc::new(SocketSink {
            recipient: ctx.address().recipient(),
        });

        if let Err(e) = self.state.sessions.open(&self.session_id, sink) {
            warn!(session_id = %self.session_id, error = %e, "Refusing connection");
            self.send(ctx, &ServerMessage::error(e.to_string()));
            ctx.close(Some(ws::CloseReason {
                code: ws::CloseCode::Again,
                description: Some(e.to_string()),
            }));
            ctx.stop();
            return;
        }
        info!(session_id = %self.session_id, "Client connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "Heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.dispatcher.close_session(&self.session_id);
        info!(session_id = %self.session_id, "Client disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_frame(&data);
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, ?reason, "Client closed socket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<Deliver> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        self.send(ctx, &msg.0);
    }
}

/// Upgrade `GET /ws` to a relay connection.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "WebSocket upgrade request");
    ws::start(RelaySocket::new(state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(parse_control(r#"{"type":"tts_stop"}"#).unwrap(), ControlMessage::TtsStop);
        assert_eq!(
            parse_control(r#"{"type":"set_speed","speed":0.8}"#).unwrap(),
            ControlMessage::SetSpeed { speed: 0.8 }
        );
    }

    #[test]
    fn test_invalid_json_gets_error_reply() {
        assert_eq!(
            parse_control("{not json").unwrap_err(),
            ServerMessage::error("Invalid JSON format")
        );
    }

    #[test]
    fn test_unknown_control_type() {
        let reply = parse_control(r#"{"type":"launch"}"#).unwrap_err();
        assert_eq!(reply, ServerMessage::error("Unsupported control message: launch"));
    }
}
