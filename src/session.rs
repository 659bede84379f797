use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use derivative::Derivative;
use tokio::sync::{mpsc, Mutex};

use crate::{
    audio_observer::AudioObserver, config::RouterConfig, receiver::Receiver, router::Router,
    subscriber::Subscriber,
};

/// One participant: a publisher-side router paired with a subscriber.
pub trait Peer: Send + Sync {
    fn id(&self) -> &str;
    fn router(&self) -> &Arc<Router>;
    fn subscriber(&self) -> &Arc<Subscriber>;
}

/// A room of peers. Publishing a track fans it out to every present peer;
/// a joining peer is subscribed to everything already published.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> &str;
    fn audio_observer(&self) -> &Arc<AudioObserver>;
    async fn publish(&self, router: &Arc<Router>, receiver: Arc<Receiver>);
    async fn subscribe(&self, peer: Arc<dyn Peer>);
    async fn add_peer(&self, peer: Arc<dyn Peer>);
    async fn remove_peer(&self, peer_id: &str);
    async fn get_peer(&self, peer_id: &str) -> Option<Arc<dyn Peer>>;
    async fn peers(&self) -> Vec<Arc<dyn Peer>>;
}

pub type OnActiveSpeakersFn = Box<dyn Fn(Vec<String>) + Send + Sync>;
pub type OnEmptyFn = Box<dyn Fn() + Send + Sync>;

/// In-process [`Session`] implementation.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct LocalSession {
    id: String,
    #[derivative(Debug = "ignore")]
    peers: Mutex<HashMap<String, Arc<dyn Peer>>>,
    audio_observer: Arc<AudioObserver>,
    closed: AtomicBool,
    stop_sender: mpsc::UnboundedSender<()>,
    #[derivative(Debug = "ignore")]
    on_active_speakers_fn: Arc<StdMutex<Option<OnActiveSpeakersFn>>>,
    #[derivative(Debug = "ignore")]
    on_empty_fn: StdMutex<Option<OnEmptyFn>>,
}

impl LocalSession {
    pub fn new(id: String, config: &RouterConfig) -> Arc<Self> {
        let audio_observer = Arc::new(AudioObserver::new(
            config.audio_level_threshold,
            config.audio_level_interval,
            config.audio_level_filter,
        ));
        let (stop_sender, mut stop_receiver) = mpsc::unbounded_channel();
        let on_active_speakers_fn: Arc<StdMutex<Option<OnActiveSpeakersFn>>> =
            Arc::new(StdMutex::new(None));

        let session = Arc::new(Self {
            id: id.clone(),
            peers: Mutex::new(HashMap::new()),
            audio_observer: audio_observer.clone(),
            closed: AtomicBool::new(false),
            stop_sender,
            on_active_speakers_fn: on_active_speakers_fn.clone(),
            on_empty_fn: StdMutex::new(None),
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(audio_observer.interval()) => {
                        let speakers = audio_observer.calc();
                        let callback = on_active_speakers_fn.lock().unwrap();
                        if let Some(f) = callback.as_ref() {
                            (f)(speakers);
                        }
                    }
                    _ = stop_receiver.recv() => break,
                }
            }
            tracing::debug!("Session {} audio observer loop finished", id);
        });

        session
    }

    /// Reports the ranked active speakers once per configured interval.
    pub fn on_active_speakers(&self, f: OnActiveSpeakersFn) {
        let mut callback = self.on_active_speakers_fn.lock().unwrap();
        *callback = Some(f);
    }

    /// Fired when the last peer leaves; the owner drops the session then.
    pub fn on_empty(&self, f: OnEmptyFn) {
        let mut callback = self.on_empty_fn.lock().unwrap();
        *callback = Some(f);
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_sender.send(());
    }
}

#[async_trait]
impl Session for LocalSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn audio_observer(&self) -> &Arc<AudioObserver> {
        &self.audio_observer
    }

    /// Fans a freshly published receiver out to every other peer in the room.
    async fn publish(&self, router: &Arc<Router>, receiver: Arc<Receiver>) {
        let peers: Vec<Arc<dyn Peer>> = self.peers.lock().await.values().cloned().collect();
        for peer in peers {
            if peer.id() == router.id() {
                continue;
            }
            if let Err(err) = router
                .add_down_tracks(peer.subscriber(), Some(receiver.clone()))
                .await
            {
                tracing::error!(
                    "Error publishing track {} to peer {}: {}",
                    receiver.track_id(),
                    peer.id(),
                    err
                );
            }
        }
    }

    /// Subscribes a joining peer to every track already published by the
    /// other peers in the room.
    async fn subscribe(&self, peer: Arc<dyn Peer>) {
        let peers: Vec<Arc<dyn Peer>> = self.peers.lock().await.values().cloned().collect();
        for other in peers {
            if other.id() == peer.id() {
                continue;
            }
            if let Err(err) = other
                .router()
                .add_down_tracks(peer.subscriber(), None)
                .await
            {
                tracing::error!(
                    "Error subscribing peer {} to peer {}: {}",
                    peer.id(),
                    other.id(),
                    err
                );
            }
        }
    }

    async fn add_peer(&self, peer: Arc<dyn Peer>) {
        let mut peers = self.peers.lock().await;
        peers.insert(peer.id().to_owned(), peer);
    }

    /// Removes the peer and releases every down track its subscriber owns.
    /// The last removal fires the empty handler and stops the audio loop.
    async fn remove_peer(&self, peer_id: &str) {
        let removed = { self.peers.lock().await.remove(peer_id) };
        if let Some(peer) = removed {
            peer.subscriber().close();
        }

        let empty = self.peers.lock().await.is_empty();
        if empty {
            let callback = { self.on_empty_fn.lock().unwrap().take() };
            if let Some(f) = callback {
                (f)();
            }
            self.close();
        }
    }

    async fn get_peer(&self, peer_id: &str) -> Option<Arc<dyn Peer>> {
        self.peers.lock().await.get(peer_id).cloned()
    }

    async fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.lock().await.values().cloned().collect()
    }
}
