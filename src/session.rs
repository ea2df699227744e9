use crate::audio::{AudioStreamBuffer, PlaybackPoller, DEFAULT_FRAMES_PER_TICK, DEFAULT_TICK};
use crate::context::BridgeContext;
use crate::registry::clamp_volume;
use crate::rtsp::{
    self, parse_parameters, sdp_body, Incoming, Method, RtspRequest, RtspResponse,
    DEFAULT_TRANSPORT, PUBLIC_METHODS,
};
use crate::types::{DeviceId, Verb, VolumePercent};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use uuid::Uuid;

/// AirPlay volume for "muted"
const MUTE_DB: f64 = -144.0;
const MIN_DB: f64 = -30.0;

/// Lifecycle of one control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestRead,
    Dispatch,
    Responded,
    Closed,
}

/// Whether the connection survives the current request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    KeepAlive,
    Close,
}

/// Per-connection control session
///
/// Requests on one connection are handled strictly in order. Backend calls
/// started by a request are spawned so that closing the connection never
/// cancels them.
pub struct ControlSession {
    ctx: Arc<BridgeContext>,
    peer: String,
    state: SessionState,
    session_id: String,
    method: Option<Method>,
    target_uri: String,
    sequence_number: Option<u32>,
    transport_params: Option<String>,
    bound_device_id: Option<DeviceId>,
    audio: Arc<AudioStreamBuffer>,
    poller: Option<PlaybackPoller>,
}

impl ControlSession {
    pub fn new(ctx: Arc<BridgeContext>, peer: impl Into<String>) -> Self {
        Self {
            ctx,
            peer: peer.into(),
            state: SessionState::Idle,
            session_id: Uuid::new_v4().simple().to_string(),
            method: None,
            target_uri: String::new(),
            sequence_number: None,
            transport_params: None,
            bound_device_id: None,
            audio: Arc::new(AudioStreamBuffer::default()),
            poller: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bound_device(&self) -> Option<&str> {
        self.bound_device_id.as_deref()
    }

    /// Serve requests until EOF, TEARDOWN, read timeout or a malformed request
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let read_timeout = self.ctx.config.read_timeout();

        loop {
            self.state = SessionState::RequestRead;
            let incoming =
                match tokio::time::timeout(read_timeout, rtsp::read_message(&mut reader)).await {
                    Ok(Ok(Some(incoming))) => incoming,
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        tracing::warn!(peer = %self.peer, error = %e, "closing control connection");
                        break;
                    }
                    Err(_) => {
                        tracing::debug!(peer = %self.peer, "control connection idle, closing");
                        break;
                    }
                };

            let request = match incoming {
                Incoming::Request(request) => request,
                Incoming::Interleaved { payload, .. } => {
                    self.accept_media(&payload);
                    self.state = SessionState::Idle;
                    continue;
                }
            };

            self.state = SessionState::Dispatch;
            let (response, disposition) = self.dispatch(&request).await;
            let bytes = response.to_bytes(request.cseq());
            if let Err(e) = write_half.write_all(&bytes).await {
                tracing::debug!(peer = %self.peer, error = %e, "failed to write response");
                break;
            }
            if let Err(e) = write_half.flush().await {
                tracing::debug!(peer = %self.peer, error = %e, "failed to flush response");
                break;
            }
            self.state = SessionState::Responded;

            if disposition == Disposition::Close {
                break;
            }
            self.state = SessionState::Idle;
        }

        self.close().await;
    }

    async fn dispatch(&mut self, request: &RtspRequest) -> (RtspResponse, Disposition) {
        self.method = Some(request.method.clone());
        self.target_uri = request.target.clone();
        self.sequence_number = request.cseq().and_then(|s| s.parse().ok());
        tracing::debug!(
            method = %request.method,
            uri = %request.target,
            peer = %self.peer,
            cseq = ?self.sequence_number,
            "control request"
        );

        match &request.method {
            Method::Options => (
                RtspResponse::ok().with_header("Public", PUBLIC_METHODS),
                Disposition::KeepAlive,
            ),
            Method::Describe => (
                RtspResponse::ok().with_body("application/sdp", sdp_body()),
                Disposition::KeepAlive,
            ),
            Method::Setup => (self.setup(request), Disposition::KeepAlive),
            Method::Play => {
                self.relay(Verb::Play).await;
                self.start_poller();
                (
                    RtspResponse::ok().with_header("Range", "npt=0-"),
                    Disposition::KeepAlive,
                )
            }
            Method::Pause => {
                self.stop_poller().await;
                self.relay(Verb::Pause).await;
                (RtspResponse::ok(), Disposition::KeepAlive)
            }
            Method::Teardown => {
                self.stop_poller().await;
                self.relay(Verb::Stop).await;
                (RtspResponse::ok(), Disposition::Close)
            }
            Method::GetParameter => (self.get_parameter(), Disposition::KeepAlive),
            Method::SetParameter => (self.set_parameter(request).await, Disposition::KeepAlive),
            Method::Unknown(method) => {
                tracing::debug!(method = %method, peer = %self.peer, "unsupported method");
                (RtspResponse::not_implemented(), Disposition::KeepAlive)
            }
        }
    }

    fn setup(&mut self, request: &RtspRequest) -> RtspResponse {
        let transport = request
            .header("Transport")
            .unwrap_or(DEFAULT_TRANSPORT)
            .to_string();
        self.transport_params = Some(transport.clone());

        match self.ctx.registry.resolve_target(&request.target) {
            Some(id) => {
                tracing::info!(session = %self.session_id, peer = %self.peer, device_id = %id, "session bound");
                self.bound_device_id = Some(id);
            }
            None => {
                tracing::warn!(uri = %request.target, "SETUP target matches no virtual device");
            }
        }

        RtspResponse::ok()
            .with_header("Session", self.session_id.as_str())
            .with_header("Transport", transport)
    }

    fn get_parameter(&mut self) -> RtspResponse {
        let volume = self
            .device_for_request()
            .and_then(|id| self.ctx.registry.get(&id))
            .map(|d| d.volume)
            .unwrap_or(0);
        RtspResponse::ok().with_body(
            "text/parameters",
            format!("volume: {:.6}\r\n", volume_to_db(volume)),
        )
    }

    async fn set_parameter(&mut self, request: &RtspRequest) -> RtspResponse {
        let params = parse_parameters(&request.body_text());
        let Some((_, raw)) = params.iter().find(|(name, _)| name == "volume") else {
            // progress, metadata and artwork are accepted and ignored
            return RtspResponse::ok();
        };
        let Ok(db) = raw.parse::<f64>() else {
            return RtspResponse::bad_request();
        };

        let volume = volume_from_db(db);
        if let Some(id) = self.device_for_request() {
            self.ctx.registry.set_volume(&id, i64::from(volume));
        }
        self.relay(Verb::SetVolume(volume)).await;
        RtspResponse::ok()
    }

    /// Relay a verb without letting the backend decide the response
    ///
    /// The call runs in its own task. We wait at most the ack timeout for
    /// it; a failed or slow backend call is logged and the request is still
    /// acknowledged.
    async fn relay(&mut self, verb: Verb) {
        let Some(device_id) = self.device_for_request() else {
            tracing::warn!(
                verb = verb.as_str(),
                uri = %self.target_uri,
                "no matching virtual device"
            );
            return;
        };

        let bridge = self.ctx.bridge.clone();
        let handle = tokio::spawn(async move { bridge.dispatch(&device_id, verb).await });
        match tokio::time::timeout(self.ctx.config.ack_timeout(), handle).await {
            Ok(Ok(outcome)) if !outcome.is_ack() => {
                tracing::debug!(verb = verb.as_str(), "acknowledging although the backend call failed");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(verb = verb.as_str(), error = %e, "bridge task panicked"),
            Err(_) => {
                tracing::debug!(verb = verb.as_str(), "backend still busy, acknowledging");
            }
        }
    }

    /// The bound device, resolving the current target when unbound
    fn device_for_request(&mut self) -> Option<DeviceId> {
        if self.bound_device_id.is_none() {
            self.bound_device_id = self.ctx.registry.resolve_target(&self.target_uri);
        }
        self.bound_device_id.clone()
    }

    /// Queue inbound media while playing; drop it otherwise
    fn accept_media(&self, payload: &[u8]) {
        if self.poller.is_some() {
            self.audio.append(payload);
        } else {
            tracing::trace!(bytes = payload.len(), peer = %self.peer, "media outside PLAY dropped");
        }
    }

    fn start_poller(&mut self) {
        if self.poller.is_none() {
            self.poller = Some(PlaybackPoller::start(
                self.audio.clone(),
                DEFAULT_FRAMES_PER_TICK,
                DEFAULT_TICK,
            ));
        }
    }

    async fn stop_poller(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.stop().await;
        }
    }

    async fn close(&mut self) {
        self.stop_poller().await;
        self.state = SessionState::Closed;
        tracing::debug!(session = %self.session_id, peer = %self.peer, "control session closed");
    }
}

/// Serve one accepted control connection to completion
pub async fn handle_connection<S>(stream: S, peer: String, ctx: Arc<BridgeContext>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ControlSession::new(ctx, peer).run(stream).await
}

/// AirPlay dB (−30..0, −144 mute) to percent
pub fn volume_from_db(db: f64) -> VolumePercent {
    if !db.is_finite() || db <= MUTE_DB {
        return 0;
    }
    let db = db.clamp(MIN_DB, 0.0);
    clamp_volume(((db - MIN_DB) / -MIN_DB * 100.0).round() as i64)
}

/// Percent to AirPlay dB
pub fn volume_to_db(volume: VolumePercent) -> f64 {
    if volume == 0 {
        return MUTE_DB;
    }
    MIN_DB + f64::from(volume.min(100)) / 100.0 * -MIN_DB
}
