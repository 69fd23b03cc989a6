//! TCP Order Gateway
//!
//! Accepts framed binary connections, authenticates them against the
//! session layer, and forwards submissions into the exchange. Protocol
//! violations close the offending connection (and only it) after an audit
//! record; the session is removed on every disconnect path so connection
//! ids can never leak an identity.

use crate::api::wire::{self, ClientMessage, WireError};
use crate::auth::session::{AuthError, AuthOutcome, ConnectionId, SessionManager};
use crate::db::Database;
use crate::services::exchange::Exchange;
use crate::services::matching::types::{price_from_dollars, now_millis, Order, OrderKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct TcpGateway {
    exchange: Arc<Exchange>,
    sessions: Arc<SessionManager>,
    db: Database,
    next_conn_id: AtomicU64,
}

impl TcpGateway {
    pub fn new(exchange: Arc<Exchange>, sessions: Arc<SessionManager>, db: Database) -> Self {
        Self {
            exchange,
            sessions,
            db,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Accept loop; one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        info!(addr = ?listener.local_addr().ok(), "tcp gateway listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = Arc::clone(&self);
                    tokio::spawn(async move {
                        let conn_id = gateway.next_conn_id.fetch_add(1, Ordering::Relaxed);
                        debug!(conn_id, %peer, "connection opened");
                        if let Err(e) = gateway.handle_connection(conn_id, stream).await {
                            debug!(conn_id, error = %e, "connection closed with error");
                        }
                        gateway.sessions.remove(conn_id);
                        debug!(conn_id, "connection closed");
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        conn_id: ConnectionId,
        mut stream: TcpStream,
    ) -> std::io::Result<()> {
        let mut length_buf = [0u8; 4];
        let mut body = vec![0u8; wire::MAX_FRAME_SIZE];

        loop {
            if stream.read_exact(&mut length_buf).await.is_err() {
                // Clean or abrupt disconnect; either way we are done.
                return Ok(());
            }
            let frame_len = u32::from_be_bytes(length_buf) as usize;
            if let Err(e) = wire::check_frame_length(frame_len) {
                self.audit_violation(conn_id, &e).await;
                return Ok(());
            }

            let body_len = frame_len - 4;
            stream.read_exact(&mut body[..body_len]).await?;

            let message = match wire::decode_frame(&body[..body_len]) {
                Ok(message) => message,
                Err(e) => {
                    self.audit_violation(conn_id, &e).await;
                    return Ok(());
                }
            };

            match message {
                ClientMessage::Login { token } => {
                    let response = self.handle_login(conn_id, &token).await;
                    stream.write_all(&response).await?;
                }
                ClientMessage::SubmitOrder(request) => {
                    let response = self.handle_submit(conn_id, request);
                    stream.write_all(&response).await?;
                }
                ClientMessage::Heartbeat => {
                    self.sessions.touch(conn_id);
                    stream.write_all(&wire::encode_heartbeat_ack()).await?;
                }
            }
        }
    }

    async fn handle_login(&self, conn_id: ConnectionId, token: &str) -> bytes::BytesMut {
        match self.sessions.authenticate(conn_id, token).await {
            Ok(AuthOutcome::Authenticated(user_id)) => {
                wire::encode_login_response(true, &format!("Welcome {user_id}"))
            }
            Ok(AuthOutcome::AlreadyAuthenticated(_)) => {
                wire::encode_login_response(true, "Already authenticated")
            }
            Err(AuthError::InvalidToken) => {
                if let Err(e) = self
                    .db
                    .record_security_event("failed_login", Some(conn_id as i64), "invalid token")
                    .await
                {
                    warn!(error = %e, "failed to record security event");
                }
                wire::encode_login_response(false, "Invalid token")
            }
            Err(e) => {
                warn!(conn_id, error = %e, "authentication backend failure");
                wire::encode_login_response(false, "Authentication unavailable")
            }
        }
    }

    fn handle_submit(
        &self,
        conn_id: ConnectionId,
        request: wire::OrderRequest,
    ) -> bytes::BytesMut {
        let Some(session_user) = self.sessions.user_id(conn_id) else {
            return wire::encode_order_response(&request.order_id, false, "Not authenticated");
        };
        self.sessions.touch(conn_id);

        // The session identity is authoritative over whatever user id the
        // client put on the wire.
        if !request.user_id.is_empty() && request.user_id != session_user {
            warn!(
                conn_id,
                frame_user = %request.user_id,
                session_user = %session_user,
                "user_id mismatch, substituting session identity"
            );
        }

        let Ok(quantity) = i64::try_from(request.quantity) else {
            return wire::encode_order_response(&request.order_id, false, "invalid quantity");
        };

        let price = match request.kind {
            OrderKind::Market => 0,
            _ => price_from_dollars(request.price_dollars),
        };

        let mut order = Order::new(
            request.order_id.clone(),
            session_user,
            request.symbol.clone(),
            request.side,
            request.kind,
            quantity,
            price,
        );
        order.timestamp_ms = if request.timestamp_ms > 0 {
            request.timestamp_ms as i64
        } else {
            now_millis()
        };

        match self.exchange.submit(&request.symbol, order) {
            Ok(()) => wire::encode_order_response(&request.order_id, true, "accepted"),
            Err(e) => wire::encode_order_response(&request.order_id, false, &e.to_string()),
        }
    }

    async fn audit_violation(&self, conn_id: ConnectionId, error: &WireError) {
        warn!(conn_id, error = %error, "protocol violation, dropping connection");
        if let Err(e) = self
            .db
            .record_security_event(
                "protocol_violation",
                Some(conn_id as i64),
                &error.to_string(),
            )
            .await
        {
            warn!(error = %e, "failed to record security event");
        }
    }
}
