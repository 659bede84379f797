use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    rtp::packet::Packet,
    rtp_transceiver::{
        rtp_receiver::RTCRtpReceiver, rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection, RTCRtpTransceiverInit,
    },
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal, TrackLocalWriter},
        track_remote::TrackRemote,
    },
};

use crate::{
    config::Config,
    down_track::{DownTrack, RtpWriter},
    error::Error,
    receiver::UpTrack,
    router::Router,
    session::{Peer, Session},
    subscriber::Subscriber,
    transport::WebRtcTransport,
};

pub type OnOfferFn = Box<dyn Fn(RTCSessionDescription) + Send + Sync>;

/// Which of the peer's two connections a trickle candidate belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportTarget {
    Publisher,
    Subscriber,
}

/// Writes forwarded packets onto the negotiated local track.
#[derive(Debug)]
struct StaticTrackWriter {
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl RtpWriter for StaticTrackWriter {
    async fn write_rtp(&self, packet: &Packet) -> Result<usize, Error> {
        self.track.write_rtp(packet).await?;
        Ok(packet.payload.len())
    }
}

/// One participant: pairs the publisher-side router and transport with the
/// subscriber-side transport, and wires inbound tracks into the session.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PeerLocal {
    id: String,
    router: Arc<Router>,
    subscriber: Arc<Subscriber>,
    publisher_transport: Arc<WebRtcTransport>,
    subscriber_transport: Arc<WebRtcTransport>,
    closed: AtomicBool,
    #[derivative(Debug = "ignore")]
    on_offer_fn: Arc<Mutex<Option<OnOfferFn>>>,
}

impl PeerLocal {
    pub async fn new<S: Session + 'static>(
        id: String,
        session: Arc<S>,
        config: &Config,
    ) -> Result<Arc<Self>, Error> {
        let publisher_transport = Arc::new(WebRtcTransport::new(config).await?);
        let subscriber_transport = Arc::new(WebRtcTransport::new(config).await?);
        let router = Router::new(
            id.clone(),
            config.router.clone(),
            session.audio_observer().clone(),
        );
        let subscriber = Subscriber::new(id.clone(), config.media.codec.clone(), false);
        let on_offer_fn: Arc<Mutex<Option<OnOfferFn>>> = Arc::new(Mutex::new(None));

        // Aggregated receiver feedback goes back out on the publisher side.
        let pc = publisher_transport.pc();
        router.set_rtcp_writer(Box::new(move |packets| {
            let pc = pc.clone();
            Box::pin(async move {
                pc.write_rtcp(&packets).await?;
                Ok(())
            })
        }));

        Self::wire_subscriber(&subscriber, &subscriber_transport, &on_offer_fn);
        Self::wire_publisher(&publisher_transport, &router, session.clone()).await;

        let peer = Arc::new(Self {
            id,
            router,
            subscriber,
            publisher_transport,
            subscriber_transport,
            closed: AtomicBool::new(false),
            on_offer_fn,
        });

        session.add_peer(peer.clone()).await;

        Ok(peer)
    }

    /// Hooks the subscriber registry up to the subscriber-side transport:
    /// attaching a down track negotiates a sendonly transceiver and starts
    /// its RTCP reader, detaching removes the sender again.
    fn wire_subscriber(
        subscriber: &Arc<Subscriber>,
        transport: &Arc<WebRtcTransport>,
        on_offer_fn: &Arc<Mutex<Option<OnOfferFn>>>,
    ) {
        let senders: Arc<Mutex<HashMap<String, Arc<RTCRtpSender>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let pc = transport.pc();
        subscriber.set_attach_track_fn(Box::new(enc!((pc, senders) move |down_track: Arc<DownTrack>| {
            Box::pin(enc!((pc, senders) async move {
                let track = Arc::new(TrackLocalStaticRTP::new(
                    down_track.codec(),
                    down_track.id().to_owned(),
                    down_track.stream_id().to_owned(),
                ));
                let transceiver = pc
                    .add_transceiver_from_track(
                        track.clone() as Arc<dyn TrackLocal + Send + Sync>,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Sendonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
                let sender = transceiver.sender().await;
                {
                    let mut senders = senders.lock().unwrap();
                    senders.insert(down_track.id().to_owned(), sender.clone());
                }
                down_track.bind(
                    Arc::new(StaticTrackWriter { track }),
                    down_track.payload_type(),
                );
                tokio::spawn(enc!((down_track) async move {
                    Self::down_track_rtcp_loop(sender, down_track).await;
                }));
                Ok(())
            }))
        })));

        let pc = transport.pc();
        subscriber.set_detach_track_fn(Box::new(enc!((pc, senders) move |down_track: Arc<DownTrack>| {
            Box::pin(enc!((pc, senders) async move {
                let sender = { senders.lock().unwrap().remove(down_track.id()) };
                if let Some(sender) = sender {
                    if pc.connection_state() != RTCPeerConnectionState::Closed {
                        pc.remove_track(&sender).await?;
                    }
                }
                Ok(())
            }))
        })));

        let transport = transport.clone();
        let on_offer = on_offer_fn.clone();
        subscriber.on_negotiation_needed(Box::new(move || {
            let transport = transport.clone();
            let on_offer = on_offer.clone();
            tokio::spawn(async move {
                match transport.create_and_set_offer().await {
                    Ok(offer) => {
                        tracing::debug!("peer sending subscriber offer");
                        let callback = on_offer.lock().unwrap();
                        if let Some(f) = callback.as_ref() {
                            (f)(offer);
                        }
                    }
                    Err(err) => tracing::error!("could not create subscriber offer: {}", err),
                }
            });
        }));
    }

    /// Routes inbound published tracks: creates the receiver, pumps RTP into
    /// its buffer, feeds sender reports back, and announces fresh publishes
    /// to the session.
    async fn wire_publisher<S: Session + 'static>(
        transport: &Arc<WebRtcTransport>,
        router: &Arc<Router>,
        session: Arc<S>,
    ) {
        let router = router.clone();
        transport
            .on_track(Box::new(enc!((router, session) move |track: Arc<TrackRemote>, rtp_receiver: Arc<RTCRtpReceiver>| {
                Box::pin(enc!((router, session) async move {
                    let params = rtp_receiver.get_parameters().await;
                    let up_track = UpTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        ssrc: track.ssrc(),
                        codec: track.codec(),
                        kind: track.kind(),
                        header_extensions: params.header_extensions.clone(),
                    };
                    let (receiver, published) = router.add_receiver(up_track).await;

                    if let Some(buffer) = receiver.buffer() {
                        tokio::spawn(enc!((track, buffer) async move {
                            tracing::debug!("Publisher RTP loop has started for {}", track.id());
                            while let Ok((packet, _attr)) = track.read_rtp().await {
                                buffer.write(packet);
                            }
                            buffer.close();
                            tracing::debug!("Publisher RTP loop has finished for {}", track.id());
                        }));
                    }

                    tokio::spawn(enc!((router) async move {
                        while let Ok((packets, _attr)) = rtp_receiver.read_rtcp().await {
                            router.handle_publisher_rtcp(&packets).await;
                        }
                    }));

                    if published {
                        session.publish(&router, receiver).await;
                    }
                }))
            })))
            .await;
    }

    async fn down_track_rtcp_loop(sender: Arc<RTCRtpSender>, down_track: Arc<DownTrack>) {
        while let Ok((packets, _attr)) = sender.read_rtcp().await {
            if down_track.is_closed() {
                break;
            }
            down_track.handle_rtcp(packets).await;
        }
        tracing::debug!("DownTrack RTCP loop finished for {}", down_track.id());
    }

    /// Publisher side: answers the remote offer.
    pub async fn answer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, Error> {
        self.publisher_transport.get_answer_for_offer(offer).await
    }

    /// Subscriber side: applies the remote answer to our offer.
    pub async fn set_subscriber_answer(
        &self,
        answer: RTCSessionDescription,
    ) -> Result<(), Error> {
        self.subscriber_transport.set_remote_description(answer).await
    }

    pub async fn trickle(
        &self,
        candidate: RTCIceCandidateInit,
        target: TransportTarget,
    ) -> Result<(), Error> {
        match target {
            TransportTarget::Publisher => {
                self.publisher_transport.add_ice_candidate(candidate).await
            }
            TransportTarget::Subscriber => {
                self.subscriber_transport.add_ice_candidate(candidate).await
            }
        }
    }

    /// Registers the callback delivering renegotiation offers for the
    /// subscriber connection.
    pub fn on_offer(&self, f: OnOfferFn) {
        let mut callback = self.on_offer_fn.lock().unwrap();
        *callback = Some(f);
    }

    pub fn publisher_transport(&self) -> &Arc<WebRtcTransport> {
        &self.publisher_transport
    }

    pub fn subscriber_transport(&self) -> &Arc<WebRtcTransport> {
        &self.subscriber_transport
    }

    /// Tears the peer down: stops the RTCP pump, closes every receiver and
    /// down track, then both transports. Safe to call repeatedly; the caller
    /// also removes the peer from its session.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.subscriber.set_transport_closed();
        self.router.stop();
        for receiver in self.router.receivers().await {
            receiver.close();
        }
        self.subscriber.close();
        self.publisher_transport.close().await?;
        self.subscriber_transport.close().await?;
        tracing::debug!("Peer {} is closed", self.id);
        Ok(())
    }
}

impl Peer for PeerLocal {
    fn id(&self) -> &str {
        &self.id
    }

    fn router(&self) -> &Arc<Router> {
        &self.router
    }

    fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }
}
