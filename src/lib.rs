#![deny(missing_debug_implementations)]
//! # Mediamesh
//! Mediamesh is a Selective Forwarding Unit core: it accepts real-time audio
//! and video streams from publishing participants and forwards per-subscriber
//! copies to the other participants of a session without transcoding, only
//! rewriting transport-level packet metadata. Packets flow from a publisher's
//! [`receiver::Receiver`] through its buffer out to every bound
//! [`down_track::DownTrack`], with NACK-driven retransmission and
//! keyframe-synchronized simulcast layer switches. A [`signal::Signal`] state
//! machine negotiates each connection's session description and ICE
//! candidates over a persistent message channel.
//!
//! ICE, DTLS and SRTP live in the underlying transport library; this crate
//! consumes already-decrypted RTP/RTCP and hands plaintext back for delivery.

/// Periodic active-speaker estimation from per-stream audio levels.
pub mod audio_observer;
/// Jitter-ordering and packet-history ring for one inbound track.
pub mod buffer;
/// Configuration for [`router::Router`], [`peer::PeerLocal`] and the transports.
pub mod config;
/// Forwarding engine for one outbound, per-subscriber copy of a track.
pub mod down_track;
pub mod error;
mod helpers;
/// Codec and header extension registration for the transport boundary.
pub mod media_engine;
/// A participant: one publisher-side router paired with one subscriber transport.
pub mod peer;
/// Forwarding engine for one inbound track.
pub mod receiver;
/// Router binds a publisher's inbound tracks to receivers and creates down
/// tracks on demand for subscribers.
pub mod router;
/// Retransmission bookkeeping across sequence-number spaces.
pub mod sequencer;
/// A room of peers wiring publishers to subscribers.
pub mod session;
/// The session registry.
pub mod sfu;
/// Per-connection signaling state machine.
pub mod signal;
/// Per-peer registry of outbound tracks and codec capabilities.
pub mod subscriber;
/// [`webrtc::peer_connection::RTCPeerConnection`] wrapper at the transport boundary.
pub mod transport;
