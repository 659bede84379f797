use std::{future::Future, pin::Pin, sync::Arc};

use derivative::Derivative;
use enclose::enc;
use interceptor::registry::Registry;
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder,
    },
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    peer_connection::{sdp::session_description::RTCSessionDescription, RTCPeerConnection},
    rtp_transceiver::rtp_receiver::RTCRtpReceiver,
    track::track_remote::TrackRemote,
};

use crate::{
    config::Config,
    error::{Error, TransportErrorKind},
    media_engine,
};

pub type OnIceCandidateFn = Box<dyn Fn(RTCIceCandidate) + Send + Sync>;
pub type OnTrackFn = Box<
    dyn Fn(Arc<TrackRemote>, Arc<RTCRtpReceiver>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// Wrapper around one [`RTCPeerConnection`] at the external transport
/// boundary: ICE establishment, DTLS and SRTP all live below this line. The
/// core hands plaintext RTP/RTCP across it.
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct WebRtcTransport {
    pub id: String,
    peer_connection: Arc<RTCPeerConnection>,
    pending_candidates: Arc<Mutex<Vec<RTCIceCandidateInit>>>,
    #[derivative(Debug = "ignore")]
    on_ice_candidate_fn: Arc<Mutex<OnIceCandidateFn>>,
    #[derivative(Debug = "ignore")]
    on_track_fn: Arc<Mutex<Option<OnTrackFn>>>,
}

impl WebRtcTransport {
    pub async fn new(config: &Config) -> Result<Self, Error> {
        let id = Uuid::new_v4().to_string();

        let mut me = MediaEngine::default();
        media_engine::register_codecs(&mut me, &config.media)?;
        let registry = register_default_interceptors(Registry::new(), &mut me)?;
        let api = APIBuilder::new()
            .with_media_engine(me)
            .with_interceptor_registry(registry)
            .with_setting_engine(config.transport.setting_engine())
            .build();

        let peer_connection = api
            .new_peer_connection(config.transport.configuration())
            .await?;

        let transport = Self {
            id,
            peer_connection: Arc::new(peer_connection),
            pending_candidates: Arc::new(Mutex::new(Vec::new())),
            on_ice_candidate_fn: Arc::new(Mutex::new(Box::new(|_| {}))),
            on_track_fn: Arc::new(Mutex::new(None)),
        };

        transport.ice_state_hooks().await;

        tracing::debug!("WebRtcTransport {} is created", transport.id);

        Ok(transport)
    }

    pub fn pc(&self) -> Arc<RTCPeerConnection> {
        self.peer_connection.clone()
    }

    /// Publisher side: applies the remote offer and produces the local answer.
    pub async fn get_answer_for_offer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, Error> {
        tracing::debug!("transport {} set remote description", self.id);
        self.peer_connection.set_remote_description(offer).await?;
        self.drain_pending_candidates().await;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer).await?;
        match self.peer_connection.local_description().await {
            Some(answer) => Ok(answer),
            None => Err(Error::new_transport(
                "Failed to set local description".to_string(),
                TransportErrorKind::LocalDescriptionError,
            )),
        }
    }

    /// Subscriber side: creates an offer and waits for ICE gathering so the
    /// description carries the candidates.
    pub async fn create_and_set_offer(&self) -> Result<RTCSessionDescription, Error> {
        let offer = self.peer_connection.create_offer(None).await?;

        let mut gathering_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(offer).await?;
        let _ = gathering_complete.recv().await;

        match self.peer_connection.local_description().await {
            Some(offer) => Ok(offer),
            None => Err(Error::new_transport(
                "Failed to set local description".to_string(),
                TransportErrorKind::LocalDescriptionError,
            )),
        }
    }

    pub async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.peer_connection.set_remote_description(sdp).await?;
        self.drain_pending_candidates().await;
        Ok(())
    }

    /// Applies a trickle ICE candidate, holding it back until a remote
    /// description exists.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if self.peer_connection.remote_description().await.is_some() {
            tracing::debug!("Adding ICE candidate for {:#?}", candidate);
            self.peer_connection.add_ice_candidate(candidate).await?;
        } else {
            tracing::debug!("Pending ICE candidate for {:#?}", candidate);
            self.pending_candidates.lock().await.push(candidate);
        }
        Ok(())
    }

    async fn drain_pending_candidates(&self) {
        let mut pendings = self.pending_candidates.lock().await;
        for candidate in pendings.drain(..) {
            tracing::debug!("Adding pending ICE candidate: {:#?}", candidate);
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
    }

    async fn ice_state_hooks(&self) {
        let peer = self.peer_connection.clone();
        let on_ice_candidate = Arc::clone(&self.on_ice_candidate_fn);

        // This callback is called after initializing PeerConnection with ICE servers.
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            Box::pin({
                let func = on_ice_candidate.clone();
                async move {
                    let locked = func.lock().await;
                    if let Some(candidate) = candidate {
                        tracing::info!("on ice candidate: {}", candidate);
                        (locked)(candidate);
                    }
                }
            })
        }));

        let on_track = Arc::clone(&self.on_track_fn);
        peer.on_track(Box::new(enc!( (on_track)
            move |track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>, _transceiver| {
                Box::pin(enc!( (on_track, track, receiver) async move {
                    tracing::info!("Track published: id={}, ssrc={}", track.id(), track.ssrc());
                    let locked = on_track.lock().await;
                    if let Some(f) = locked.as_ref() {
                        (f)(track, receiver).await;
                    }
                }))
            }
        )));

        peer.on_ice_gathering_state_change(Box::new(move |state| {
            Box::pin(async move {
                tracing::debug!("ICE gathering state changed: {}", state);
            })
        }));
    }

    // Hooks
    pub async fn on_ice_candidate(&self, f: OnIceCandidateFn) {
        let mut callback = self.on_ice_candidate_fn.lock().await;
        *callback = f;
    }

    pub async fn on_track(&self, f: OnTrackFn) {
        let mut callback = self.on_track_fn.lock().await;
        *callback = Some(f);
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        tracing::debug!("WebRtcTransport {} is dropped", self.id);
    }
}
