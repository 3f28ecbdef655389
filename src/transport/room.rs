//! Room transport: audio carried through a LiveKit room.
//!
//! The server participates in a room using a token-authenticated signaling
//! connection; the room server and the browser client it bridges to are
//! external collaborators. Media framing over the session is canonical
//! 16 kHz mono PCM in binary websocket messages; the SFU side of the
//! bridge owns WebRTC itself.
//!
//! Access tokens are LiveKit-shaped JWTs: HS256, `iss` = API key, `sub` =
//! participant identity, and a `video` grant naming the room.

use super::Transport;
use crate::audio::AudioChunk;
use crate::audio::codec::AudioBuffer;
use crate::config::RoomConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capture channel depth, matching the local transport.
const CAPTURE_CHANNEL_SIZE: usize = 100;

/// JWT claims for a LiveKit access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    /// API key.
    pub iss: String,
    /// Participant identity.
    pub sub: String,
    /// Not-before, unix seconds.
    pub nbf: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Room grant.
    pub video: VideoGrant,
}

/// The room permissions grant.
#[derive(Debug, Serialize, Deserialize)]
pub struct VideoGrant {
    pub room: String,
    #[serde(rename = "roomJoin")]
    pub room_join: bool,
    #[serde(rename = "canPublish")]
    pub can_publish: bool,
    #[serde(rename = "canSubscribe")]
    pub can_subscribe: bool,
}

/// Mint a signed access token for the configured room.
///
/// # Errors
///
/// Returns an error when the API secret is missing or signing fails.
pub fn mint_access_token(config: &RoomConfig, identity: &str, now_unix: i64) -> Result<String> {
    if config.api_key.is_empty() || config.api_secret.is_empty() {
        return Err(VoiceError::Transport(
            "room transport requires LIVEKIT_API_KEY and LIVEKIT_API_SECRET".into(),
        ));
    }
    let claims = AccessClaims {
        iss: config.api_key.clone(),
        sub: identity.to_owned(),
        nbf: now_unix,
        exp: now_unix + config.token_ttl_s as i64,
        video: VideoGrant {
            room: config.room_name.clone(),
            room_join: true,
            can_publish: true,
            can_subscribe: true,
        },
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.api_secret.as_bytes()),
    )
    .map_err(|e| VoiceError::Transport(format!("token signing: {e}")))
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// A joined room session: the writer half of the signaling socket plus a
/// broadcast of inbound audio.
struct RoomSession {
    sink: Mutex<WsSink>,
    inbound: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

/// Transport that speaks through a LiveKit room.
pub struct RoomTransport {
    config: RoomConfig,
    session: Arc<Mutex<Option<Arc<RoomSession>>>>,
    joined: Arc<std::sync::atomic::AtomicBool>,
}

impl RoomTransport {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            config,
            session: Arc::new(Mutex::new(None)),
            joined: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Whether a live room session is currently joined. The engine uses
    /// this to resolve `transport: auto`.
    pub async fn is_joined(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Lock-free view of the joined state, safe to read from sync paths.
    pub fn joined_flag(&self) -> Arc<std::sync::atomic::AtomicBool> {
        Arc::clone(&self.joined)
    }

    /// Join the configured room, establishing the signaling connection.
    /// Idempotent: joining while joined is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if token minting or the connection fails.
    pub async fn join(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        let token = mint_access_token(&self.config, "voicemode-server", now)?;
        let url = format!(
            "{}/rtc?access_token={token}&auto_subscribe=1",
            self.config.url.trim_end_matches('/')
        );

        info!(room = %self.config.room_name, "joining room");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| VoiceError::Transport(format!("room connect: {e}")))?;
        let (sink, mut source) = stream.split();

        // Reader task: binary frames are audio; everything else is
        // signaling chatter we log at debug.
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(CAPTURE_CHANNEL_SIZE);
        let session_slot = Arc::clone(&self.session);
        let joined_flag = Arc::clone(&self.joined);
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Binary(bytes)) => {
                        if inbound_tx.send(bytes.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(other) => debug!("room signaling: {other:?}"),
                }
            }
            warn!("room connection closed");
            joined_flag.store(false, std::sync::atomic::Ordering::Relaxed);
            *session_slot.lock().await = None;
        });

        *guard = Some(Arc::new(RoomSession {
            sink: Mutex::new(sink),
            inbound: Mutex::new(Some(inbound_rx)),
        }));
        self.joined.store(true, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Leave the room, closing the signaling connection.
    pub async fn leave(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            let mut sink = session.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            info!("left room");
        }
        self.joined.store(false, std::sync::atomic::Ordering::Relaxed);
    }

    async fn current_session(&self) -> Result<Arc<RoomSession>> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| VoiceError::Transport("no room session joined".into()))
    }
}

#[async_trait]
impl Transport for RoomTransport {
    fn name(&self) -> &'static str {
        "room"
    }

    async fn play(
        &self,
        mut rx: mpsc::Receiver<Vec<f32>>,
        sample_rate: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let session = self.current_session().await?;

        while let Some(frame) = tokio::select! {
            frame = rx.recv() => frame,
            () = cancel.cancelled() => None,
        } {
            let canonical = AudioBuffer::from_f32(&frame, sample_rate, 1);
            let mut bytes = Vec::with_capacity(canonical.samples.len() * 2);
            for sample in &canonical.samples {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
            let mut sink = session.sink.lock().await;
            sink.send(Message::Binary(bytes.into()))
                .await
                .map_err(|e| VoiceError::Transport(format!("room publish: {e}")))?;
        }
        Ok(())
    }

    async fn start_capture(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<AudioChunk>> {
        let session = self.current_session().await?;
        let mut inbound = session
            .inbound
            .lock()
            .await
            .take()
            .ok_or_else(|| VoiceError::Transport("room capture already active".into()))?;

        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_SIZE);
        let session_for_return = Arc::clone(&session);
        tokio::spawn(async move {
            loop {
                let bytes = tokio::select! {
                    b = inbound.recv() => match b {
                        Some(b) => b,
                        None => break,
                    },
                    () = cancel.cancelled() => break,
                };
                let samples: Vec<f32> = bytes
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
                    .collect();
                let chunk = AudioChunk {
                    samples,
                    sample_rate: AudioBuffer::CANONICAL_RATE,
                    captured_at: Instant::now(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            // Hand the inbound stream back for the next recording.
            *session_for_return.inbound.lock().await = Some(inbound);
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    fn room_config() -> RoomConfig {
        RoomConfig {
            url: "ws://127.0.0.1:7880".into(),
            api_key: "devkey".into(),
            api_secret: "secret-of-sufficient-length".into(),
            room_name: "voicemode".into(),
            token_ttl_s: 3_600,
        }
    }

    #[test]
    fn token_carries_identity_and_room_grant() {
        let token = mint_access_token(&room_config(), "voicemode-server", 1_700_000_000).unwrap();

        let mut validation = Validation::default();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.set_required_spec_claims::<&str>(&[]);
        let decoded = jsonwebtoken::decode::<AccessClaims>(
            &token,
            &DecodingKey::from_secret(b"secret-of-sufficient-length"),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims.iss, "devkey");
        assert_eq!(decoded.claims.sub, "voicemode-server");
        assert_eq!(decoded.claims.video.room, "voicemode");
        assert!(decoded.claims.video.room_join);
        assert_eq!(decoded.claims.exp - decoded.claims.nbf, 3_600);
    }

    #[test]
    fn token_requires_credentials() {
        let mut config = room_config();
        config.api_secret = String::new();
        assert!(mint_access_token(&config, "x", 0).is_err());
    }

    #[tokio::test]
    async fn transport_starts_unjoined() {
        let transport = RoomTransport::new(room_config());
        assert!(!transport.is_joined().await);
        // Operations without a session fail with a transport error.
        match transport.current_session().await {
            Err(VoiceError::Transport(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected no session"),
        }
    }
}
