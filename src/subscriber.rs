use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use derivative::Derivative;
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};

use crate::{config::CodecConfig, down_track::DownTrack, error::Error};

pub type AttachTrackFn = Box<
    dyn Fn(Arc<DownTrack>) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>
        + Send
        + Sync,
>;
pub type DetachTrackFn = Box<
    dyn Fn(Arc<DownTrack>) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>
        + Send
        + Sync,
>;
pub type OnNegotiateFn = Box<dyn Fn() + Send + Sync>;

/// Outbound side of one peer: the registry of down tracks delivered to that
/// subscriber, the codec capabilities it advertised, and the hooks used to
/// attach tracks to its transport and to trigger renegotiation.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Subscriber {
    pub id: String,
    peer_id: String,
    codecs: CodecConfig,
    no_auto_subscribe: bool,
    down_tracks: Mutex<HashMap<String, Vec<Arc<DownTrack>>>>,
    transport_closed: AtomicBool,
    #[derivative(Debug = "ignore")]
    attach_fn: Mutex<Option<AttachTrackFn>>,
    #[derivative(Debug = "ignore")]
    detach_fn: Mutex<Option<DetachTrackFn>>,
    #[derivative(Debug = "ignore")]
    on_negotiate_fn: Mutex<Option<OnNegotiateFn>>,
}

impl Subscriber {
    pub fn new(peer_id: String, codecs: CodecConfig, no_auto_subscribe: bool) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        Arc::new(Self {
            id,
            peer_id,
            codecs,
            no_auto_subscribe,
            down_tracks: Mutex::new(HashMap::new()),
            transport_closed: AtomicBool::new(false),
            attach_fn: Mutex::new(None),
            detach_fn: Mutex::new(None),
            on_negotiate_fn: Mutex::new(None),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn no_auto_subscribe(&self) -> bool {
        self.no_auto_subscribe
    }

    pub fn codecs(&self, kind: RTPCodecType) -> Vec<RTCRtpCodecParameters> {
        match kind {
            RTPCodecType::Audio => self.codecs.audio.clone(),
            _ => self.codecs.video.clone(),
        }
    }

    /// Installs the transport attach hook. Without one, attaching is a
    /// successful no-op, which is what test doubles rely on.
    pub fn set_attach_track_fn(&self, f: AttachTrackFn) {
        let mut attach = self.attach_fn.lock().unwrap();
        *attach = Some(f);
    }

    pub fn set_detach_track_fn(&self, f: DetachTrackFn) {
        let mut detach = self.detach_fn.lock().unwrap();
        *detach = Some(f);
    }

    pub fn on_negotiation_needed(&self, f: OnNegotiateFn) {
        let mut callback = self.on_negotiate_fn.lock().unwrap();
        *callback = Some(f);
    }

    pub(crate) async fn attach(&self, down_track: Arc<DownTrack>) -> Result<(), Error> {
        let fut = {
            let attach = self.attach_fn.lock().unwrap();
            attach.as_ref().map(|f| f(down_track))
        };
        match fut {
            Some(fut) => fut.await,
            None => Ok(()),
        }
    }

    pub(crate) async fn detach(&self, down_track: Arc<DownTrack>) -> Result<(), Error> {
        let fut = {
            let detach = self.detach_fn.lock().unwrap();
            detach.as_ref().map(|f| f(down_track))
        };
        match fut {
            Some(fut) => fut.await,
            None => Ok(()),
        }
    }

    /// Asks the owning peer to renegotiate its subscriber transport.
    pub fn negotiate(&self) {
        let callback = self.on_negotiate_fn.lock().unwrap();
        if let Some(f) = callback.as_ref() {
            (f)();
        }
    }

    pub fn add_down_track(&self, stream_id: &str, down_track: Arc<DownTrack>) {
        let mut down_tracks = self.down_tracks.lock().unwrap();
        down_tracks
            .entry(stream_id.to_owned())
            .or_default()
            .push(down_track);
    }

    pub fn get_down_tracks(&self, stream_id: &str) -> Vec<Arc<DownTrack>> {
        let down_tracks = self.down_tracks.lock().unwrap();
        down_tracks.get(stream_id).cloned().unwrap_or_default()
    }

    pub fn down_tracks(&self) -> Vec<Arc<DownTrack>> {
        let down_tracks = self.down_tracks.lock().unwrap();
        down_tracks.values().flatten().cloned().collect()
    }

    pub fn remove_down_track(&self, stream_id: &str, down_track: &Arc<DownTrack>) {
        let mut down_tracks = self.down_tracks.lock().unwrap();
        if let Some(tracks) = down_tracks.get_mut(stream_id) {
            tracks.retain(|dt| !Arc::ptr_eq(dt, down_track));
        }
    }

    /// Marks the underlying transport as fully closed, which suppresses the
    /// renegotiation normally triggered by closing down tracks.
    pub fn set_transport_closed(&self) {
        self.transport_closed.store(true, Ordering::Release);
    }

    pub fn is_transport_closed(&self) -> bool {
        self.transport_closed.load(Ordering::Acquire)
    }

    /// Releases every down track owned by this subscriber.
    pub fn close(&self) {
        let all = {
            let mut down_tracks = self.down_tracks.lock().unwrap();
            let all: Vec<_> = down_tracks.values().flatten().cloned().collect();
            down_tracks.clear();
            all
        };
        for down_track in all {
            down_track.close();
        }
        tracing::debug!("Subscriber {} for peer {} is closed", self.id, self.peer_id);
    }
}
