use std::{
    future::Future,
    ops::ControlFlow,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, time::Instant};
use uuid::Uuid;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{sdp::session_description::RTCSessionDescription, RTCPeerConnection},
};

use crate::error::{Error, SignalErrorKind, TransportErrorKind};

/// Upper bound on one inbound signaling frame.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Keepalive and queue timings for one signaling connection.
#[derive(Clone, Debug)]
pub struct SignalConfig {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(120),
            ping_period: Duration::from_secs(60),
        }
    }
}

/// One frame on the duplex message channel. The transport glue maps these to
/// its own text and control frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping,
    Pong,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

/// Wire format of one signaling message.
#[derive(Serialize, Deserialize, Debug)]
pub struct SignalMessage {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Serialize, Debug)]
struct WarningFrame {
    warning: String,
}

#[derive(Serialize, Debug)]
struct ErrorFrame {
    error: String,
}

#[derive(Serialize, Debug)]
struct StatusFrame {
    status: String,
}

pub type OnNegotiateFn = Box<
    dyn Fn(RTCSessionDescription) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>
        + Send
        + Sync,
>;
pub type OnSetRemoteSdpFn = OnNegotiateFn;
pub type OnTrickleFn = Box<
    dyn Fn(RTCIceCandidateInit) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>
        + Send
        + Sync,
>;
pub type OnSignalCloseFn = Box<dyn Fn() + Send + Sync>;

/// Per-connection signaling state machine.
///
/// One reader task processes inbound frames serially, one writer task is the
/// only writer to the transport and also emits the periodic keepalive ping.
/// Any inbound frame extends the read deadline; missing it, or a read error,
/// closes the connection.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Signal {
    id: String,
    config: SignalConfig,
    #[derivative(Debug = "ignore")]
    peer_connection: Option<Arc<RTCPeerConnection>>,
    send: mpsc::UnboundedSender<Frame>,
    send_receiver: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    state: Mutex<SignalState>,
    closed: AtomicBool,
    #[derivative(Debug = "ignore")]
    on_negotiate_fn: tokio::sync::Mutex<Option<OnNegotiateFn>>,
    #[derivative(Debug = "ignore")]
    on_set_remote_sdp_fn: tokio::sync::Mutex<Option<OnSetRemoteSdpFn>>,
    #[derivative(Debug = "ignore")]
    on_trickle_fn: tokio::sync::Mutex<Option<OnTrickleFn>>,
    #[derivative(Debug = "ignore")]
    on_close_fn: Mutex<Option<OnSignalCloseFn>>,
}

impl Signal {
    pub fn new(peer_connection: Option<Arc<RTCPeerConnection>>, config: SignalConfig) -> Arc<Self> {
        let (send, send_receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            config,
            peer_connection,
            send,
            send_receiver: Mutex::new(Some(send_receiver)),
            state: Mutex::new(SignalState::Idle),
            closed: AtomicBool::new(false),
            on_negotiate_fn: tokio::sync::Mutex::new(None),
            on_set_remote_sdp_fn: tokio::sync::Mutex::new(None),
            on_trickle_fn: tokio::sync::Mutex::new(None),
            on_close_fn: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SignalState {
        *self.state.lock().unwrap()
    }

    /// Overrides the default offer handling.
    pub async fn on_negotiate(&self, f: OnNegotiateFn) {
        let mut callback = self.on_negotiate_fn.lock().await;
        *callback = Some(f);
    }

    /// Overrides the default answer handling.
    pub async fn on_set_remote_sdp(&self, f: OnSetRemoteSdpFn) {
        let mut callback = self.on_set_remote_sdp_fn.lock().await;
        *callback = Some(f);
    }

    /// Overrides the default trickle ICE handling.
    pub async fn on_trickle(&self, f: OnTrickleFn) {
        let mut callback = self.on_trickle_fn.lock().await;
        *callback = Some(f);
    }

    /// Fired once when the connection goes down, so the owning peer can tear
    /// down its transports.
    pub fn on_close(&self, f: OnSignalCloseFn) {
        let mut callback = self.on_close_fn.lock().unwrap();
        *callback = Some(f);
    }

    /// Spawns the reader and writer tasks over the duplex channel. The
    /// transport guarantees at most one concurrent reader and writer, which
    /// these two tasks are.
    pub fn start(
        self: &Arc<Self>,
        incoming: mpsc::UnboundedReceiver<Frame>,
        outgoing: mpsc::UnboundedSender<Frame>,
    ) {
        let reader = self.clone();
        tokio::spawn(async move {
            reader.read_loop(incoming).await;
        });
        let writer = self.clone();
        tokio::spawn(async move {
            writer.write_loop(outgoing).await;
        });
    }

    async fn read_loop(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Frame>) {
        let mut deadline = Instant::now() + self.config.pong_wait;
        loop {
            tokio::select! {
                frame = incoming.recv() => {
                    match frame {
                        None | Some(Frame::Close) => break,
                        Some(Frame::Ping) => {
                            deadline = Instant::now() + self.config.pong_wait;
                            self.send_frame(Frame::Pong);
                        }
                        Some(Frame::Pong) => {
                            deadline = Instant::now() + self.config.pong_wait;
                        }
                        Some(Frame::Text(text)) => {
                            deadline = Instant::now() + self.config.pong_wait;
                            if text.len() > MAX_MESSAGE_SIZE {
                                tracing::warn!("signal {} dropped oversized message", self.id);
                                break;
                            }
                            if self.handle_message(&text).await.is_break() {
                                break;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("signal {} read deadline exceeded", self.id);
                    break;
                }
            }
        }
        self.close();
        tracing::debug!("signal {} read loop finished", self.id);
    }

    async fn write_loop(self: Arc<Self>, outgoing: mpsc::UnboundedSender<Frame>) {
        let queue = { self.send_receiver.lock().unwrap().take() };
        let Some(mut queue) = queue else {
            return;
        };
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.ping_period,
            self.config.ping_period,
        );
        loop {
            tokio::select! {
                message = queue.recv() => {
                    match message {
                        Some(Frame::Close) | None => {
                            let _ = outgoing.send(Frame::Close);
                            break;
                        }
                        Some(frame) => {
                            if outgoing.send(frame).is_err() {
                                break;
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    if outgoing.send(Frame::Ping).is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("signal {} write loop finished", self.id);
    }

    async fn handle_message(&self, raw: &str) -> ControlFlow<()> {
        let message: SignalMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!("could not unmarshal message: {}", err);
                return ControlFlow::Break(());
            }
        };

        match message.event.as_str() {
            "candidate" => {
                let candidate: RTCIceCandidateInit = match serde_json::from_value(message.data) {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        let text = format!("could not unmarshal candidate msg: {}", err);
                        tracing::error!("{}", text);
                        self.send_warning(text);
                        return ControlFlow::Break(());
                    }
                };

                let handler = self.on_trickle_fn.lock().await;
                if let Some(f) = handler.as_ref() {
                    if let Err(err) = (f)(candidate).await {
                        tracing::error!("trickle handler failed: {}", err);
                    }
                    return ControlFlow::Continue(());
                }
                if let Some(pc) = &self.peer_connection {
                    if let Err(err) = pc.add_ice_candidate(candidate).await {
                        let text = format!("Error taking candidate: {}", err);
                        tracing::error!("signal {}: {}", self.id, text);
                        self.send_warning(text);
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            }
            "answer" => {
                let answer: RTCSessionDescription = match serde_json::from_value(message.data) {
                    Ok(answer) => answer,
                    Err(err) => {
                        tracing::error!("could not unmarshal answer msg: {}", err);
                        return ControlFlow::Break(());
                    }
                };

                let handler = self.on_set_remote_sdp_fn.lock().await;
                if let Some(f) = handler.as_ref() {
                    if let Err(err) = (f)(answer).await {
                        tracing::error!("remote sdp handler failed: {}", err);
                    }
                } else if let Some(pc) = &self.peer_connection {
                    if let Err(err) = pc.set_remote_description(answer).await {
                        tracing::error!("could not set remote description: {}", err);
                        return ControlFlow::Break(());
                    }
                }
                let mut state = self.state.lock().unwrap();
                *state = SignalState::Connected;
                ControlFlow::Continue(())
            }
            "offer" => {
                let offer: RTCSessionDescription = match serde_json::from_value(message.data) {
                    Ok(offer) => offer,
                    Err(err) => {
                        tracing::error!("could not unmarshal offer msg: {}", err);
                        return ControlFlow::Break(());
                    }
                };
                {
                    let mut state = self.state.lock().unwrap();
                    *state = SignalState::Negotiating;
                }

                let handler = self.on_negotiate_fn.lock().await;
                if let Some(f) = handler.as_ref() {
                    if let Err(err) = (f)(offer).await {
                        tracing::error!("negotiate handler failed: {}", err);
                    }
                    return ControlFlow::Continue(());
                }
                drop(handler);

                match self.take_offer(offer).await {
                    Ok(answer) => match serde_json::to_value(&answer) {
                        Ok(data) => {
                            let _ = self.send_object(&SignalMessage {
                                event: "answer".to_owned(),
                                data,
                            });
                            let mut state = self.state.lock().unwrap();
                            *state = SignalState::Connected;
                            ControlFlow::Continue(())
                        }
                        Err(err) => {
                            tracing::error!("could not marshal answer: {}", err);
                            ControlFlow::Break(())
                        }
                    },
                    Err(err) => {
                        tracing::error!("could not take offer: {}", err);
                        ControlFlow::Break(())
                    }
                }
            }
            // Room join is reserved; it intentionally falls through to the
            // unknown-command reply until rooms are wired up here.
            "join" => {
                self.reply_unknown(&message.event);
                ControlFlow::Continue(())
            }
            _ => {
                self.reply_unknown(&message.event);
                ControlFlow::Continue(())
            }
        }
    }

    async fn take_offer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, Error> {
        let Some(pc) = &self.peer_connection else {
            return Err(Error::new_signal(
                "no peer connection to negotiate with".to_owned(),
                SignalErrorKind::MalformedMessageError,
            ));
        };
        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        match pc.local_description().await {
            Some(answer) => Ok(answer),
            None => Err(Error::new_transport(
                "Failed to set local description".to_string(),
                TransportErrorKind::LocalDescriptionError,
            )),
        }
    }

    fn reply_unknown(&self, event: &str) {
        let text = format!("Received unknown command '{}'. Ignored.", event);
        tracing::warn!("signal {}: {}", self.id, text);
        self.send_warning(text);
    }

    fn send_frame(&self, frame: Frame) {
        let _ = self.send.send(frame);
    }

    /// Enqueues a JSON message on the outbound queue.
    pub fn send_object<T: Serialize>(&self, value: &T) -> Result<(), Error> {
        let message = serde_json::to_string(value).map_err(|err| {
            Error::new_signal(
                format!("could not marshal message: {}", err),
                SignalErrorKind::MalformedMessageError,
            )
        })?;
        self.send.send(Frame::Text(message)).map_err(|_| {
            Error::new_signal(
                "outbound queue is closed".to_owned(),
                SignalErrorKind::QueueClosedError,
            )
        })
    }

    pub fn send_warning(&self, text: String) {
        let _ = self.send_object(&WarningFrame { warning: text });
    }

    pub fn send_error(&self, text: String) {
        let _ = self.send_object(&ErrorFrame { error: text });
    }

    pub fn send_status(&self, text: String) {
        let _ = self.send_object(&StatusFrame { status: text });
    }

    /// Closes the connection. The outbound queue is closed exactly once, the
    /// close handler fires exactly once; later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            *state = SignalState::Closed;
        }
        let _ = self.send.send(Frame::Close);
        let callback = { self.on_close_fn.lock().unwrap().take() };
        if let Some(f) = callback {
            (f)();
        }
        tracing::debug!("signal {} is closed", self.id);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use webrtc::api::APIBuilder;

    use super::*;

    fn started_signal(
        pc: Option<Arc<RTCPeerConnection>>,
        config: SignalConfig,
    ) -> (
        Arc<Signal>,
        mpsc::UnboundedSender<Frame>,
        mpsc::UnboundedReceiver<Frame>,
    ) {
        let signal = Signal::new(pc, config);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        signal.start(in_rx, out_tx);
        (signal, in_tx, out_rx)
    }

    async fn next_text(out_rx: &mut mpsc::UnboundedReceiver<Frame>) -> String {
        loop {
            match out_rx.recv().await.expect("signal hung up") {
                Frame::Text(text) => return text,
                Frame::Ping | Frame::Pong => continue,
                Frame::Close => panic!("connection closed unexpectedly"),
            }
        }
    }

    #[tokio::test]
    async fn unknown_event_gets_a_warning_and_the_connection_stays_open() {
        let (signal, in_tx, mut out_rx) = started_signal(None, SignalConfig::default());

        in_tx
            .send(Frame::Text(r#"{"event":"foo","data":{}}"#.to_owned()))
            .unwrap();
        assert_eq!(
            next_text(&mut out_rx).await,
            r#"{"warning":"Received unknown command 'foo'. Ignored."}"#
        );

        // Still serving frames afterwards.
        in_tx
            .send(Frame::Text(r#"{"event":"bar","data":{}}"#.to_owned()))
            .unwrap();
        assert_eq!(
            next_text(&mut out_rx).await,
            r#"{"warning":"Received unknown command 'bar'. Ignored."}"#
        );
        assert_ne!(signal.state(), SignalState::Closed);
    }

    #[tokio::test]
    async fn join_falls_through_to_the_unknown_command_reply() {
        let (_signal, in_tx, mut out_rx) = started_signal(None, SignalConfig::default());

        in_tx
            .send(Frame::Text(
                r#"{"event":"join","data":{"id":"bill-1","sdp":""}}"#.to_owned(),
            ))
            .unwrap();
        assert_eq!(
            next_text(&mut out_rx).await,
            r#"{"warning":"Received unknown command 'join'. Ignored."}"#
        );
    }

    #[tokio::test]
    async fn offer_without_custom_handler_produces_one_answer() {
        let client_pc = Arc::new(
            APIBuilder::new()
                .build()
                .new_peer_connection(Default::default())
                .await
                .unwrap(),
        );
        let _dc = client_pc.create_data_channel("data", None).await.unwrap();
        let offer = client_pc.create_offer(None).await.unwrap();

        let server_pc = Arc::new(
            APIBuilder::new()
                .build()
                .new_peer_connection(Default::default())
                .await
                .unwrap(),
        );
        let (signal, in_tx, mut out_rx) =
            started_signal(Some(server_pc), SignalConfig::default());

        let frame = SignalMessage {
            event: "offer".to_owned(),
            data: serde_json::to_value(&offer).unwrap(),
        };
        in_tx
            .send(Frame::Text(serde_json::to_string(&frame).unwrap()))
            .unwrap();

        let reply: SignalMessage = serde_json::from_str(&next_text(&mut out_rx).await).unwrap();
        assert_eq!(reply.event, "answer");
        let answer: RTCSessionDescription = serde_json::from_value(reply.data).unwrap();
        assert!(!answer.sdp.is_empty());
        assert_eq!(signal.state(), SignalState::Connected);

        // Exactly one reply: nothing else is queued.
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn custom_negotiation_handler_takes_precedence() {
        let (signal, in_tx, mut out_rx) = started_signal(None, SignalConfig::default());
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        signal
            .on_negotiate(Box::new(move |_offer| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .await;

        let frame = json!({
            "event": "offer",
            "data": {"type": "offer", "sdp": "v=0\r\n"},
        });
        in_tx.send(Frame::Text(frame.to_string())).unwrap();
        in_tx
            .send(Frame::Text(r#"{"event":"nudge","data":{}}"#.to_owned()))
            .unwrap();

        // The warning for the follow-up frame proves the offer was consumed
        // by the handler without a default answer.
        assert_eq!(
            next_text(&mut out_rx).await,
            r#"{"warning":"Received unknown command 'nudge'. Ignored."}"#
        );
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_candidate_payload_warns_and_closes() {
        let (signal, in_tx, mut out_rx) = started_signal(None, SignalConfig::default());
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        signal.on_close(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        in_tx
            .send(Frame::Text(
                r#"{"event":"candidate","data":"nonsense"}"#.to_owned(),
            ))
            .unwrap();

        let warning = next_text(&mut out_rx).await;
        assert!(warning.contains("could not unmarshal candidate msg"));
        loop {
            match out_rx.recv().await {
                Some(Frame::Close) | None => break,
                Some(_) => continue,
            }
        }
        assert_eq!(signal.state(), SignalState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_liveness_response_closes_the_connection() {
        let config = SignalConfig {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_millis(100),
            ping_period: Duration::from_secs(600),
        };
        let (signal, _in_tx, mut out_rx) = started_signal(None, config);

        loop {
            match out_rx.recv().await {
                Some(Frame::Close) | None => break,
                Some(_) => continue,
            }
        }
        assert_eq!(signal.state(), SignalState::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (signal, _in_tx, _out_rx) = started_signal(None, SignalConfig::default());
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        signal.on_close(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        signal.close();
        signal.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(signal.state(), SignalState::Closed);
    }
}
