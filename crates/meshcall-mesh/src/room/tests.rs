use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meshcall_common::PeerId;
use meshcall_realtime::{Member, Outbound};
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};

use super::*;
use crate::error::MediaError;
use crate::media::{
    DisplayCapture, IceCandidate, MediaStream, MediaTrack, PeerConnection, PeerConnectionState,
    PeerEvent, PeerEventSink, SdpType, SenderId, SenderInfo, SessionDescription, SignalingState,
    TrackKind,
};
use crate::peer::PeerPhase;
use crate::signal::SignalData;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    AddTrack(String),
    AddTransceiver(TrackKind),
    ReplaceTrack(String, Option<String>),
    Close,
}

struct FakeConnection {
    calls: Mutex<Vec<Call>>,
    state: Mutex<SignalingState>,
    senders: Mutex<Vec<SenderInfo>>,
    offers: AtomicUsize,
}

impl FakeConnection {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(SignalingState::Stable),
            senders: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    fn candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn sender_track(&self, kind: TrackKind) -> Option<String> {
        self.senders
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.kind == kind)
            .and_then(|s| s.track_id.clone())
    }

    fn push_sender(&self, kind: TrackKind, track_id: Option<String>) -> SenderId {
        let mut senders = self.senders.lock().unwrap();
        let id = SenderId(format!("sender-{}", senders.len()));
        senders.push(SenderInfo {
            id: id.clone(),
            kind,
            track_id,
        });
        id
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.record(Call::CreateOffer);
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer("answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.record(Call::SetLocal(desc.sdp_type));
        *self.state.lock().unwrap() = match desc.sdp_type {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            _ => SignalingState::Stable,
        };
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.record(Call::SetRemote(desc.sdp_type));
        *self.state.lock().unwrap() = match desc.sdp_type {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        };
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.record(Call::AddCandidate(candidate.candidate.clone()));
        match candidate.candidate.as_str() {
            "duplicate" => Err(MediaError::DuplicateCandidate),
            "broken" => Err(MediaError::Platform("malformed candidate".into())),
            _ => Ok(()),
        }
    }

    fn add_track(&self, track: &MediaTrack, _stream: &MediaStream) -> Result<SenderId, MediaError> {
        self.record(Call::AddTrack(track.id.clone()));
        Ok(self.push_sender(track.kind, Some(track.id.clone())))
    }

    fn add_transceiver(&self, kind: TrackKind) -> Result<SenderId, MediaError> {
        self.record(Call::AddTransceiver(kind));
        Ok(self.push_sender(kind, None))
    }

    async fn replace_track(
        &self,
        sender: &SenderId,
        track: Option<&MediaTrack>,
    ) -> Result<(), MediaError> {
        let track_id = track.map(|t| t.id.clone());
        self.record(Call::ReplaceTrack(sender.0.clone(), track_id.clone()));
        let mut senders = self.senders.lock().unwrap();
        match senders.iter_mut().find(|s| s.id == *sender) {
            Some(s) => {
                s.track_id = track_id;
                Ok(())
            }
            None => Err(MediaError::Platform("unknown sender".into())),
        }
    }

    fn senders(&self) -> Vec<SenderInfo> {
        self.senders.lock().unwrap().clone()
    }

    fn signaling_state(&self) -> SignalingState {
        *self.state.lock().unwrap()
    }

    fn close(&self) {
        self.record(Call::Close);
        *self.state.lock().unwrap() = SignalingState::Closed;
    }
}

#[derive(Default)]
struct FakeFactory {
    created: Mutex<Vec<(PeerId, Arc<FakeConnection>, PeerEventSink)>>,
}

impl FakeFactory {
    fn connection(&self, peer: &str) -> Option<Arc<FakeConnection>> {
        let peer = PeerId::from(peer);
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _, _)| *p == peer)
            .map(|(_, c, _)| c.clone())
    }

    fn sink(&self, peer: &str) -> Option<PeerEventSink> {
        let peer = PeerId::from(peer);
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _, _)| *p == peer)
            .map(|(_, _, s)| s.clone())
    }

    fn created_for(&self) -> Vec<PeerId> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _, _)| p.clone())
            .collect()
    }
}

impl PeerConnectionFactory for FakeFactory {
    fn create(
        &self,
        peer: &PeerId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let connection = Arc::new(FakeConnection::new());
        self.created
            .lock()
            .unwrap()
            .push((peer.clone(), connection.clone(), events));
        Ok(connection)
    }
}

#[derive(Default)]
struct FakeDevices {
    counter: AtomicUsize,
    stopped: Mutex<Vec<String>>,
    deny_display: AtomicBool,
    display_audio: AtomicBool,
    display_ended: Mutex<Vec<oneshot::Sender<()>>>,
}

impl FakeDevices {
    fn next(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    /// Simulate the user ending the latest capture from outside the app.
    fn end_latest_capture(&self) {
        if let Some(ended) = self.display_ended.lock().unwrap().pop() {
            let _ = ended.send(());
        }
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn user_media(&self, audio: bool, video: bool) -> Result<MediaStream, MediaError> {
        let n = self.next();
        let mut stream = MediaStream::new(format!("local-{n}"));
        if audio {
            stream.add_track(MediaTrack::audio(format!("mic-{n}"), "Built-in Microphone"));
        }
        if video {
            stream.add_track(MediaTrack::video(format!("cam-{n}"), "FaceTime HD Camera"));
        }
        Ok(stream)
    }

    async fn display_media(&self) -> Result<DisplayCapture, MediaError> {
        if self.deny_display.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("display capture".into()));
        }
        let n = self.next();
        let mut stream =
            MediaStream::new(format!("screen-{n}")).with_track(MediaTrack::video(format!("screen-video-{n}"), "Screen 1"));
        if self.display_audio.load(Ordering::SeqCst) {
            stream.add_track(MediaTrack::audio(format!("screen-audio-{n}"), "System Audio"));
        }
        let (tx, ended) = oneshot::channel();
        self.display_ended.lock().unwrap().push(tx);
        Ok(DisplayCapture { stream, ended })
    }

    fn stop_track(&self, track: &MediaTrack) {
        self.stopped.lock().unwrap().push(track.id.clone());
    }
}

#[derive(Default)]
struct RecordingWhisper {
    sent: Mutex<Vec<(String, Value)>>,
}

impl RecordingWhisper {
    fn envelopes(&self) -> Vec<SignalEnvelope> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, v)| SignalEnvelope::from_value(v))
            .collect()
    }

    fn sent_to(&self, peer: &str) -> Vec<SignalData> {
        let peer = PeerId::from(peer);
        self.envelopes()
            .into_iter()
            .filter(|e| e.to == peer)
            .map(|e| e.data)
            .collect()
    }

    fn share_status_to(&self, peer: &str) -> Vec<bool> {
        self.sent_to(peer)
            .into_iter()
            .filter_map(|d| match d {
                SignalData::ScreenShareStatus { is_sharing } => Some(is_sharing),
                _ => None,
            })
            .collect()
    }

    fn offers_to(&self, peer: &str) -> usize {
        self.sent_to(peer)
            .iter()
            .filter(|d| matches!(d, SignalData::Offer { .. }))
            .count()
    }
}

#[async_trait]
impl Whisper for RecordingWhisper {
    async fn whisper(&self, event: &str, data: Value) -> Outbound {
        self.sent.lock().unwrap().push((event.to_string(), data));
        Outbound::Queued
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    room: Room,
    events: broadcast::Receiver<RoomEvent>,
    factory: Arc<FakeFactory>,
    devices: Arc<FakeDevices>,
    whisper: Arc<RecordingWhisper>,
}

fn start(local: &str) -> Harness {
    start_with(local, RoomConfig::default())
}

fn start_with(local: &str, config: RoomConfig) -> Harness {
    let factory = Arc::new(FakeFactory::default());
    let devices = Arc::new(FakeDevices::default());
    let whisper = Arc::new(RecordingWhisper::default());
    let (room, events) = Room::with_signaling(
        PeerId::from(local),
        "signal",
        whisper.clone(),
        factory.clone(),
        devices.clone(),
        config,
    );
    Harness {
        room,
        events,
        factory,
        devices,
        whisper,
    }
}

fn member(id: &str, name: &str) -> Member {
    Member::new(id, json!({ "name": name }))
}

fn envelope(from: &str, to: &str, data: SignalData) -> SignalEnvelope {
    SignalEnvelope {
        to: PeerId::from(to),
        from: PeerId::from(from),
        data,
    }
}

fn candidate(value: &str) -> SignalData {
    SignalData::Candidate {
        candidate: IceCandidate::new(value),
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn settle(room: &Room) {
    room.barrier().await;
}

fn drain(events: &mut broadcast::Receiver<RoomEvent>) -> Vec<RoomEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn smaller_id_offers_with_tracks_already_attached() {
    let h = start("3");
    h.room
        .on_roster(vec![member("3", "Ada"), member("7", "Bo")]);

    eventually("offer to 7", || h.whisper.offers_to("7") == 1).await;
    assert_eq!(h.factory.created_for(), vec![PeerId::from("7")]);

    let conn = h.factory.connection("7").unwrap();
    let offer_at = conn.position(&Call::CreateOffer).unwrap();
    let mic_at = conn.position(&Call::AddTrack("mic-0".into())).unwrap();
    let cam_at = conn.position(&Call::AddTrack("cam-0".into())).unwrap();
    assert!(mic_at < offer_at && cam_at < offer_at);

    let snapshot = h.room.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[&PeerId::from("7")].name.as_deref(), Some("Bo"));
}

#[tokio::test]
async fn larger_id_only_answers() {
    let h = start("7");
    h.room.on_roster(vec![member("3", "Ada"), member("7", "Bo")]);
    settle(&h.room).await;

    let conn = h.factory.connection("3").unwrap();
    assert_eq!(conn.count(&Call::CreateOffer), 0);
    assert_eq!(h.whisper.offers_to("3"), 0);

    h.room.on_signal(envelope(
        "3",
        "7",
        SignalData::Offer {
            sdp: SessionDescription::offer("remote-offer"),
        },
    ));
    eventually("answer to 3", || {
        h.whisper
            .sent_to("3")
            .iter()
            .any(|d| matches!(d, SignalData::Answer { .. }))
    })
    .await;
    assert_eq!(conn.signaling_state(), SignalingState::Stable);

    // Toggling media on the answering side never produces an offer.
    h.room.toggle_camera().await.unwrap();
    assert_eq!(conn.count(&Call::CreateOffer), 0);
}

#[tokio::test]
async fn signal_from_unknown_peer_creates_it() {
    let h = start("12");
    h.room.on_signal(envelope(
        "9",
        "12",
        SignalData::Offer {
            sdp: SessionDescription::offer("o"),
        },
    ));
    eventually("peer 9 created", || h.factory.connection("9").is_some()).await;
    eventually("participant 9", || {
        h.room.snapshot().contains_key(&PeerId::from("9"))
    })
    .await;
}

#[tokio::test]
async fn envelopes_for_someone_else_are_ignored() {
    let h = start("12");
    h.room.on_signal(envelope("9", "13", candidate("c1")));
    settle(&h.room).await;
    assert!(h.factory.created_for().is_empty());
}

#[tokio::test]
async fn early_candidates_flush_in_order_after_remote_description() {
    let h = start("12");
    h.room.on_signal(envelope("9", "12", candidate("c1")));
    h.room.on_signal(envelope("9", "12", candidate("c2")));
    settle(&h.room).await;

    let conn = h.factory.connection("9").unwrap();
    assert!(conn.candidates().is_empty());

    h.room.on_signal(envelope(
        "9",
        "12",
        SignalData::Offer {
            sdp: SessionDescription::offer("o"),
        },
    ));
    h.room.on_signal(envelope("9", "12", candidate("c3")));
    settle(&h.room).await;

    assert_eq!(conn.candidates(), vec!["c1", "c2", "c3"]);
    let remote_at = conn.position(&Call::SetRemote(SdpType::Offer)).unwrap();
    let first_candidate_at = conn.position(&Call::AddCandidate("c1".into())).unwrap();
    assert!(remote_at < first_candidate_at);
}

#[tokio::test]
async fn initiator_flushes_candidates_after_answer() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    eventually("offer", || h.whisper.offers_to("7") == 1).await;

    h.room.on_signal(envelope("7", "3", candidate("c1")));
    settle(&h.room).await;
    let conn = h.factory.connection("7").unwrap();
    assert!(conn.candidates().is_empty());

    h.room.on_signal(envelope(
        "7",
        "3",
        SignalData::Answer {
            sdp: SessionDescription::answer("a"),
        },
    ));
    settle(&h.room).await;
    assert_eq!(conn.candidates(), vec!["c1"]);
}

#[tokio::test]
async fn candidate_errors_stay_scoped_to_the_peer() {
    let mut h = start("12");
    h.room.on_roster(vec![member("9", "Nine"), member("10", "Ten")]);
    h.room.on_signal(envelope(
        "9",
        "12",
        SignalData::Offer {
            sdp: SessionDescription::offer("o"),
        },
    ));
    h.room.on_signal(envelope("9", "12", candidate("duplicate")));
    h.room.on_signal(envelope("9", "12", candidate("broken")));
    settle(&h.room).await;

    let errors: Vec<_> = drain(&mut h.events)
        .into_iter()
        .filter(|e| matches!(e, RoomEvent::PeerError { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], RoomEvent::PeerError { peer, .. } if *peer == PeerId::from("9")));
    // Neither failure is fatal.
    assert_eq!(h.room.snapshot().len(), 2);
}

#[tokio::test]
async fn local_candidates_are_relayed() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    eventually("peer", || h.factory.sink("7").is_some()).await;

    h.factory
        .sink("7")
        .unwrap()
        .emit(PeerEvent::IceCandidate(IceCandidate::new("local-1")));
    eventually("candidate relayed", || {
        h.whisper
            .sent_to("7")
            .contains(&candidate("local-1"))
    })
    .await;
}

#[tokio::test]
async fn renegotiation_waits_for_the_pending_answer() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    eventually("offer", || h.whisper.offers_to("7") == 1).await;
    let conn = h.factory.connection("7").unwrap();

    h.room.toggle_camera().await.unwrap();
    assert_eq!(conn.count(&Call::CreateOffer), 1);

    h.room.on_signal(envelope(
        "7",
        "3",
        SignalData::Answer {
            sdp: SessionDescription::answer("a"),
        },
    ));
    eventually("deferred offer", || h.whisper.offers_to("7") == 2).await;
    assert_eq!(conn.count(&Call::CreateOffer), 2);
}

#[tokio::test]
async fn unexpected_answer_tears_the_peer_down() {
    let mut h = start("7");
    h.room.on_roster(vec![member("3", "Ada"), member("9", "Nine")]);
    settle(&h.room).await;
    let conn = h.factory.connection("3").unwrap();

    h.room.on_signal(envelope(
        "3",
        "7",
        SignalData::Answer {
            sdp: SessionDescription::answer("a"),
        },
    ));
    settle(&h.room).await;

    assert_eq!(conn.count(&Call::Close), 1);
    let snapshot = h.room.snapshot();
    assert!(!snapshot.contains_key(&PeerId::from("3")));
    assert!(snapshot.contains_key(&PeerId::from("9")));
    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, RoomEvent::PeerError { peer, .. } if *peer == PeerId::from("3"))));
}

#[tokio::test]
async fn offer_sent_to_the_initiator_is_rejected() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    eventually("offer", || h.whisper.offers_to("7") == 1).await;

    h.room.on_signal(envelope(
        "7",
        "3",
        SignalData::Offer {
            sdp: SessionDescription::offer("glare"),
        },
    ));
    settle(&h.room).await;
    let conn = h.factory.connection("7").unwrap();
    assert_eq!(conn.count(&Call::Close), 1);
    assert_eq!(conn.count(&Call::CreateAnswer), 0);
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn member_left_closes_connection_and_removes_participant() {
    let mut h = start("3");
    h.room
        .on_roster(vec![member("7", "Bo"), member("12", "Cy")]);
    settle(&h.room).await;
    let conn = h.factory.connection("12").unwrap();
    let mut snapshots = h.room.participants();
    let _ = snapshots.borrow_and_update();

    h.room.on_member_left(PeerId::from("12"));
    snapshots.changed().await.unwrap();
    // By the time the snapshot drops the participant, the connection is closed.
    assert!(!snapshots.borrow().contains_key(&PeerId::from("12")));
    assert_eq!(conn.count(&Call::Close), 1);

    h.room.on_member_left(PeerId::from("12"));
    settle(&h.room).await;
    assert_eq!(conn.count(&Call::Close), 1);
    assert!(h.room.snapshot().contains_key(&PeerId::from("7")));

    let left: Vec<_> = drain(&mut h.events)
        .into_iter()
        .filter(|e| matches!(e, RoomEvent::ParticipantLeft(_)))
        .collect();
    assert_eq!(left, vec![RoomEvent::ParticipantLeft(PeerId::from("12"))]);
}

#[tokio::test]
async fn failed_connection_is_torn_down() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    eventually("peer", || h.factory.sink("7").is_some()).await;

    h.factory
        .sink("7")
        .unwrap()
        .emit(PeerEvent::ConnectionState(PeerConnectionState::Failed));
    eventually("participant removed", || h.room.snapshot().is_empty()).await;
    assert_eq!(h.factory.connection("7").unwrap().count(&Call::Close), 1);
}

#[tokio::test]
async fn events_from_a_replaced_connection_are_ignored() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    eventually("peer", || h.factory.sink("7").is_some()).await;
    let stale = h.factory.sink("7").unwrap();

    h.room.on_member_left(PeerId::from("7"));
    h.room.on_member_joined(member("7", "Bo"));
    settle(&h.room).await;
    assert_eq!(h.factory.created_for().len(), 2);

    stale.emit(PeerEvent::Track {
        track: MediaTrack::video("v1", "camera"),
        stream: MediaStream::new("s1").with_track(MediaTrack::video("v1", "camera")),
    });
    settle(&h.room).await;
    let snapshot = h.room.snapshot();
    assert!(snapshot[&PeerId::from("7")].camera_stream.is_none());
}

#[tokio::test]
async fn roster_without_a_peer_tears_it_down() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo"), member("12", "Cy")]);
    settle(&h.room).await;

    h.room.on_roster(vec![member("3", "Ada"), member("7", "Bo")]);
    settle(&h.room).await;
    let snapshot = h.room.snapshot();
    assert_eq!(snapshot.keys().cloned().collect::<Vec<_>>(), vec![PeerId::from("7")]);
    // The surviving peer keeps its connection.
    assert_eq!(h.factory.created_for().len(), 2);
}

#[tokio::test]
async fn leave_is_idempotent() {
    let mut h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    settle(&h.room).await;

    h.room.leave().await;
    h.room.leave().await;

    let conn = h.factory.connection("7").unwrap();
    assert_eq!(conn.count(&Call::Close), 1);
    let stopped = h.devices.stopped();
    assert!(stopped.contains(&"cam-0".to_string()));
    assert_eq!(
        drain(&mut h.events)
            .iter()
            .filter(|e| **e == RoomEvent::Left)
            .count(),
        1
    );
    assert!(matches!(
        h.room.toggle_camera().await,
        Err(MeshError::RoomClosed)
    ));
}

// ---------------------------------------------------------------------------
// Remote media
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remote_tracks_update_the_snapshot() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    eventually("peer", || h.factory.sink("7").is_some()).await;
    let sink = h.factory.sink("7").unwrap();

    let camera = MediaTrack::video("v1", "FaceTime HD Camera");
    let mic = MediaTrack::audio("a1", "Microphone");
    let stream = MediaStream::new("s1")
        .with_track(mic.clone())
        .with_track(camera.clone());
    sink.emit(PeerEvent::Track {
        track: mic,
        stream: stream.clone(),
    });
    sink.emit(PeerEvent::Track {
        track: camera,
        stream,
    });
    eventually("camera enabled", || {
        h.room
            .snapshot()
            .get(&PeerId::from("7"))
            .is_some_and(|p| p.camera_enabled && p.mic_enabled)
    })
    .await;

    // The remote swapped its camera sender over to a screen capture.
    h.room.on_signal(envelope(
        "7",
        "3",
        SignalData::ScreenShareStatus { is_sharing: true },
    ));
    eventually("moved to screen", || {
        h.room
            .snapshot()
            .get(&PeerId::from("7"))
            .is_some_and(|p| p.screen_stream.is_some() && p.camera_stream.is_none())
    })
    .await;
}

// ---------------------------------------------------------------------------
// Local media and screen share
// ---------------------------------------------------------------------------

#[tokio::test]
async fn toggles_replace_tracks_on_existing_senders() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    settle(&h.room).await;
    let conn = h.factory.connection("7").unwrap();
    let senders_before = conn.senders().len();

    assert!(!h.room.toggle_camera().await.unwrap());
    assert_eq!(conn.sender_track(TrackKind::Video), None);
    assert!(h.devices.stopped().contains(&"cam-0".to_string()));

    assert!(h.room.toggle_camera().await.unwrap());
    assert!(conn.sender_track(TrackKind::Video).is_some());
    assert_eq!(conn.senders().len(), senders_before);
}

#[tokio::test]
async fn camera_off_at_start_still_gets_a_video_sender() {
    let config = RoomConfig {
        start_with_camera: false,
        ..RoomConfig::default()
    };
    let h = start_with("3", config);
    h.room.on_roster(vec![member("7", "Bo")]);
    settle(&h.room).await;

    let conn = h.factory.connection("7").unwrap();
    assert_eq!(conn.count(&Call::AddTransceiver(TrackKind::Video)), 1);
    assert_eq!(conn.sender_track(TrackKind::Video), None);
}

#[tokio::test]
async fn screen_share_replaces_and_restores_the_camera_track() {
    let mut h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    settle(&h.room).await;
    let conn = h.factory.connection("7").unwrap();
    let senders = conn.senders().len();
    let camera = conn.sender_track(TrackKind::Video).unwrap();

    h.room.start_screen_share().await.unwrap();
    let shared = conn.sender_track(TrackKind::Video).unwrap();
    assert!(shared.starts_with("screen-video-"));
    assert_eq!(conn.senders().len(), senders);
    // No audio in the capture: the microphone keeps its sender.
    assert_eq!(conn.sender_track(TrackKind::Audio).as_deref(), Some("mic-0"));
    assert_eq!(h.whisper.share_status_to("7"), vec![true]);

    h.room.stop_screen_share().await.unwrap();
    assert_eq!(conn.sender_track(TrackKind::Video), Some(camera));
    assert_eq!(h.whisper.share_status_to("7"), vec![true, false]);
    assert!(h.devices.stopped().contains(&shared));

    let events = drain(&mut h.events);
    assert!(events.contains(&RoomEvent::ScreenShareStarted));
    assert!(events.contains(&RoomEvent::ScreenShareStopped));
}

#[tokio::test]
async fn stopping_with_camera_off_leaves_the_sender_silent() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    settle(&h.room).await;
    let conn = h.factory.connection("7").unwrap();

    h.room.start_screen_share().await.unwrap();
    assert!(!h.room.toggle_camera().await.unwrap());
    // Still sharing: the camera toggle does not touch the video sender.
    assert!(conn.sender_track(TrackKind::Video).unwrap().starts_with("screen-video-"));

    h.room.stop_screen_share().await.unwrap();
    assert_eq!(conn.sender_track(TrackKind::Video), None);
    assert_eq!(conn.senders().len(), 2);
}

#[tokio::test]
async fn capture_audio_takes_over_the_audio_sender() {
    let h = start("3");
    h.devices.display_audio.store(true, Ordering::SeqCst);
    h.room.on_roster(vec![member("7", "Bo")]);
    settle(&h.room).await;
    let conn = h.factory.connection("7").unwrap();

    h.room.start_screen_share().await.unwrap();
    assert!(conn
        .sender_track(TrackKind::Audio)
        .unwrap()
        .starts_with("screen-audio-"));

    h.room.stop_screen_share().await.unwrap();
    assert_eq!(conn.sender_track(TrackKind::Audio).as_deref(), Some("mic-0"));
}

#[tokio::test]
async fn restarting_a_share_keeps_one_share_and_one_notification() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo"), member("12", "Cy")]);
    settle(&h.room).await;

    h.room.start_screen_share().await.unwrap();
    let first = h.factory.connection("7").unwrap().sender_track(TrackKind::Video).unwrap();
    h.room.start_screen_share().await.unwrap();
    let second = h.factory.connection("7").unwrap().sender_track(TrackKind::Video).unwrap();

    assert_ne!(first, second);
    assert!(h.devices.stopped().contains(&first));
    assert!(!h.devices.stopped().contains(&second));
    assert_eq!(h.whisper.share_status_to("7"), vec![true]);
    assert_eq!(h.whisper.share_status_to("12"), vec![true]);
    assert_eq!(
        h.factory.connection("12").unwrap().sender_track(TrackKind::Video),
        Some(second)
    );
}

#[tokio::test]
async fn denied_capture_keeps_the_running_share() {
    let mut h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    settle(&h.room).await;
    h.room.start_screen_share().await.unwrap();
    let conn = h.factory.connection("7").unwrap();
    let shared = conn.sender_track(TrackKind::Video).unwrap();
    drain(&mut h.events);

    h.devices.deny_display.store(true, Ordering::SeqCst);
    let err = h.room.start_screen_share().await.unwrap_err();
    assert!(matches!(
        err,
        MeshError::Media(MediaError::PermissionDenied(_))
    ));
    assert_eq!(conn.sender_track(TrackKind::Video), Some(shared));
    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, RoomEvent::MediaFailed(_))));
}

#[tokio::test]
async fn capture_ended_outside_the_app_stops_the_share() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    settle(&h.room).await;
    h.room.start_screen_share().await.unwrap();

    h.devices.end_latest_capture();
    eventually("share stopped", || {
        h.whisper.share_status_to("7") == vec![true, false]
    })
    .await;
    let conn = h.factory.connection("7").unwrap();
    assert_eq!(conn.sender_track(TrackKind::Video).as_deref(), Some("cam-0"));
}

#[tokio::test]
async fn late_joiner_receives_the_share() {
    let h = start("3");
    h.room.start_screen_share().await.unwrap();

    h.room.on_member_joined(member("7", "Bo"));
    eventually("offer", || h.whisper.offers_to("7") == 1).await;

    let conn = h.factory.connection("7").unwrap();
    assert!(conn
        .sender_track(TrackKind::Video)
        .unwrap()
        .starts_with("screen-video-"));
    assert_eq!(h.whisper.share_status_to("7"), vec![true]);
}

#[tokio::test]
async fn stop_without_a_share_does_nothing() {
    let h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    settle(&h.room).await;
    h.room.stop_screen_share().await.unwrap();
    assert!(h.whisper.share_status_to("7").is_empty());
}

#[tokio::test]
async fn peer_phases_are_published() {
    let mut h = start("3");
    h.room.on_roster(vec![member("7", "Bo")]);
    eventually("peer", || h.factory.sink("7").is_some()).await;
    h.factory
        .sink("7")
        .unwrap()
        .emit(PeerEvent::ConnectionState(PeerConnectionState::Connected));
    settle(&h.room).await;

    let phases: HashMap<PeerPhase, usize> =
        drain(&mut h.events)
            .into_iter()
            .fold(HashMap::new(), |mut acc, e| {
                if let RoomEvent::PeerStateChanged { state, .. } = e {
                    *acc.entry(state).or_default() += 1;
                }
                acc
            });
    assert_eq!(phases.get(&PeerPhase::Negotiating), Some(&1));
    assert_eq!(phases.get(&PeerPhase::Connected), Some(&1));
}
