//! Integration tests: real TCP sessions against a running server.
//!
//! Every server listens on `127.0.0.1:0`; tests talk to it with a small
//! RTSP peer built on the crate's own message codec.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rtsp::protocol::auth::Challenge;
use rtsp::protocol::{InterleavedFrame, Message, RtspRequest, RtspResponse, read_message};
use rtsp::{
    MediaBus, MediaPacket, PacketKind, PacketSink, Server, ServerConfig, SessionState,
    SetupFailurePolicy, StaticAuthenticator, StreamHub, TrackKind,
};

const AV_SDP: &str = "v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=Stream\r\n\
    c=IN IP4 127.0.0.1\r\n\
    t=0 0\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=control:trackID=0\r\n\
    m=audio 0 RTP/AVP 97\r\n\
    a=rtpmap:97 MPEG4-GENERIC/44100/2\r\n\
    a=control:trackID=1\r\n";

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    }
}

fn start_server(config: ServerConfig) -> (Server, Arc<StreamHub>, String) {
    let hub = Arc::new(StreamHub::new());
    let mut server = Server::new(config, hub.clone());
    server.start().expect("server start");
    let addr = server.local_addr().expect("bound address");
    (server, hub, format!("rtsp://{addr}"))
}

fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    f()
}

/// Minimal RTSP peer: one buffered reader for the whole connection, so
/// interleaved frames and responses are never lost between calls.
struct Peer {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    cseq: u32,
    frames: Vec<InterleavedFrame>,
}

impl Peer {
    fn connect(base: &str) -> Self {
        let addr: SocketAddr = base.trim_start_matches("rtsp://").parse().unwrap();
        let stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT).expect("connect");
        stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        Peer {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
            cseq: 0,
            frames: Vec::new(),
        }
    }

    fn request(&mut self, method: &str, uri: &str, headers: &[(&str, &str)]) -> RtspResponse {
        self.send(method, uri, headers, None)
    }

    fn send(
        &mut self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<&str>,
    ) -> RtspResponse {
        self.cseq += 1;
        let mut req = RtspRequest::new(method, uri).add_header("CSeq", &self.cseq.to_string());
        for (name, value) in headers {
            req = req.add_header(name, value);
        }
        if let Some(body) = body {
            req = req.with_body(body.to_string());
        }
        self.writer.write_all(req.serialize().as_bytes()).unwrap();
        self.read_response()
    }

    fn read_response(&mut self) -> RtspResponse {
        loop {
            match read_message(&mut self.reader).expect("read") {
                Some(Message::Response(r)) => {
                    assert_eq!(r.get_header("CSeq"), Some(self.cseq.to_string().as_str()));
                    return r;
                }
                Some(Message::Data(f)) => self.frames.push(f),
                Some(Message::Request(r)) => panic!("unexpected request {}", r.method),
                None => panic!("connection closed"),
            }
        }
    }

    fn next_frame(&mut self) -> InterleavedFrame {
        if !self.frames.is_empty() {
            return self.frames.remove(0);
        }
        match read_message(&mut self.reader).expect("read") {
            Some(Message::Data(f)) => f,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    fn send_frame(&mut self, channel: u8, payload: &[u8]) {
        let frame = InterleavedFrame::encode(channel, payload).unwrap();
        self.writer.write_all(&frame).unwrap();
    }

    /// Whether the server closed the connection.
    fn is_closed(&mut self) -> bool {
        matches!(read_message(&mut self.reader), Ok(None) | Err(_))
    }

    /// DESCRIBE + SETUP both tracks on channels 0/1 and 2/3; returns the token.
    fn describe_and_setup(&mut self, url: &str) -> String {
        let resp = self.request("DESCRIBE", url, &[("Accept", "application/sdp")]);
        assert_eq!(resp.status_code, 200);

        let resp = self.request(
            "SETUP",
            &format!("{url}/trackID=0"),
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
        );
        assert_eq!(resp.status_code, 200);
        let token = resp.session_id().expect("session token").to_string();

        let resp = self.request(
            "SETUP",
            &format!("{url}/trackID=1"),
            &[
                ("Transport", "RTP/AVP/TCP;unicast;interleaved=2-3"),
                ("Session", &token),
            ],
        );
        assert_eq!(resp.status_code, 200);
        token
    }
}

#[derive(Default)]
struct Collect(Mutex<Vec<MediaPacket>>);

impl PacketSink for Collect {
    fn send_packet(&self, packet: &MediaPacket) -> rtsp::Result<()> {
        self.0.lock().push(packet.clone());
        Ok(())
    }
}

#[test]
fn play_scenario_with_two_interleaved_tracks() {
    let (server, hub, base) = start_server(test_config());
    hub.publish("cam1", AV_SDP).unwrap();
    let url = format!("{base}/cam1");

    let mut peer = Peer::connect(&base);
    let resp = peer.request("OPTIONS", &url, &[]);
    assert_eq!(resp.status_code, 200);
    assert!(resp.get_header("Public").unwrap().contains("PLAY"));

    let resp = peer.request("DESCRIBE", &url, &[("Accept", "application/sdp")]);
    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.get_header("Content-Type"), Some("application/sdp"));
    assert_eq!(resp.body.as_deref(), Some(AV_SDP));

    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=0"),
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
    );
    assert_eq!(resp.status_code, 200);
    assert!(resp.get_header("Transport").unwrap().contains("interleaved=0-1"));
    let token = resp.session_id().unwrap().to_string();
    assert_eq!(
        server.registry().get(&token).unwrap().state(),
        SessionState::SetupPartial
    );

    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=1"),
        &[
            ("Transport", "RTP/AVP/TCP;unicast;interleaved=2-3"),
            ("Session", &token),
        ],
    );
    assert_eq!(resp.status_code, 200);
    assert!(resp.get_header("Transport").unwrap().contains("interleaved=2-3"));

    let resp = peer.request("PLAY", &url, &[("Session", &token)]);
    assert_eq!(resp.status_code, 200);

    let sessions = server.registry().by_stream("cam1");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, token);
    assert_eq!(sessions[0].state(), SessionState::Playing);
    assert_eq!(hub.subscriber_ids("cam1"), vec![token.clone()]);

    hub.forward("cam1", &MediaPacket::rtp(TrackKind::Audio, vec![1, 2, 3]));
    hub.forward("cam1", &MediaPacket::rtcp(TrackKind::Video, vec![4]));
    let frame = peer.next_frame();
    assert_eq!((frame.channel, frame.payload), (2, vec![1, 2, 3]));
    let frame = peer.next_frame();
    assert_eq!((frame.channel, frame.payload), (1, vec![4]));

    let info = server.sessions();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].stream_path, "cam1");
    assert!(info[0].out_bytes > 0);

    let resp = peer.request("TEARDOWN", &url, &[("Session", &token)]);
    assert_eq!(resp.status_code, 200);
    assert!(wait_until(IO_TIMEOUT, || server.registry().is_empty()));
    assert!(hub.subscriber_ids("cam1").is_empty());
}

#[test]
fn colliding_channel_is_rejected_and_state_kept() {
    let (server, hub, base) = start_server(test_config());
    hub.publish("cam1", AV_SDP).unwrap();
    let url = format!("{base}/cam1");
    let mut peer = Peer::connect(&base);

    peer.request("DESCRIBE", &url, &[]);
    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=0"),
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
    );
    let token = resp.session_id().unwrap().to_string();

    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=1"),
        &[
            ("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1"),
            ("Session", &token),
        ],
    );
    assert_eq!(resp.status_code, 461);
    let session = server.registry().get(&token).unwrap();
    assert_eq!(session.state(), SessionState::SetupPartial);

    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=0"),
        &[
            ("Transport", "RTP/AVP/TCP;unicast;interleaved=6-7"),
            ("Session", &token),
        ],
    );
    assert_eq!(resp.status_code, 455);
    assert_eq!(session.state(), SessionState::SetupPartial);

    // The session is still usable after both failures.
    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=1"),
        &[
            ("Transport", "RTP/AVP/TCP;unicast;interleaved=2-3"),
            ("Session", &token),
        ],
    );
    assert_eq!(resp.status_code, 200);
    assert_eq!(session.state(), SessionState::SetupComplete);
}

#[test]
fn token_is_required_and_checked() {
    let (server, hub, base) = start_server(test_config());
    hub.publish("cam1", AV_SDP).unwrap();
    let url = format!("{base}/cam1");
    let mut peer = Peer::connect(&base);
    let token = peer.describe_and_setup(&url);

    let resp = peer.request("PLAY", &url, &[]);
    assert_eq!(resp.status_code, 454);
    let resp = peer.request("PLAY", &url, &[("Session", "DEADBEEF")]);
    assert_eq!(resp.status_code, 454);
    let resp = peer.request("PAUSE", &url, &[("Session", &token)]);
    assert_eq!(resp.status_code, 455);
    assert_eq!(
        server.registry().get(&token).unwrap().state(),
        SessionState::SetupComplete
    );

    let resp = peer.request("PLAY", &url, &[("Session", &token)]);
    assert_eq!(resp.status_code, 200);
    let resp = peer.request("PAUSE", &url, &[("Session", &token)]);
    assert_eq!(resp.status_code, 200);
    assert!(hub.subscriber_ids("cam1").is_empty());
}

#[test]
fn describe_of_unknown_stream_is_not_found() {
    let (_server, _hub, base) = start_server(test_config());
    let mut peer = Peer::connect(&base);
    let resp = peer.request("DESCRIBE", &format!("{base}/nothing"), &[]);
    assert_eq!(resp.status_code, 404);
    let resp = peer.request("FROBNICATE", &format!("{base}/nothing"), &[]);
    assert_eq!(resp.status_code, 501);
}

#[test]
fn idle_connection_is_closed_and_deregistered() {
    let config = ServerConfig {
        timeout_ms: 200,
        ..test_config()
    };
    let (server, _hub, base) = start_server(config);
    let mut peer = Peer::connect(&base);
    let resp = peer.request("OPTIONS", &base, &[]);
    assert_eq!(resp.status_code, 200);
    assert_eq!(server.registry().len(), 1);

    assert!(wait_until(IO_TIMEOUT, || server.registry().is_empty()));
    assert!(peer.is_closed());
}

#[test]
fn repeated_violations_close_the_session() {
    let config = ServerConfig {
        max_protocol_violations: 2,
        ..test_config()
    };
    let (server, _hub, base) = start_server(config);
    let mut peer = Peer::connect(&base);

    let resp = peer.request("PLAY", &base, &[("Session", "BAD")]);
    assert_eq!(resp.status_code, 454);
    let resp = peer.request("OPTIONS", &base, &[]);
    assert_eq!(resp.status_code, 200);

    // Counting restarted after the OPTIONS; two more in a row close it.
    peer.request("PLAY", &base, &[("Session", "BAD")]);
    let resp = peer.request("RECORD", &base, &[("Session", "BAD")]);
    assert_eq!(resp.status_code, 454);
    assert!(peer.is_closed());
    assert!(wait_until(IO_TIMEOUT, || server.registry().is_empty()));
}

#[test]
fn announce_and_record_publish_frames_to_the_bus() {
    let (server, hub, base) = start_server(test_config());
    let url = format!("{base}/live/cam2");
    let mut peer = Peer::connect(&base);

    let resp = peer.send(
        "ANNOUNCE",
        &url,
        &[("Content-Type", "application/sdp")],
        Some(AV_SDP),
    );
    assert_eq!(resp.status_code, 200);

    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=0"),
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record")],
    );
    assert_eq!(resp.status_code, 200);
    assert!(resp.get_header("Transport").unwrap().contains("mode=record"));
    let token = resp.session_id().unwrap().to_string();
    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=1"),
        &[
            ("Transport", "RTP/AVP/TCP;unicast;interleaved=2-3;mode=record"),
            ("Session", &token),
        ],
    );
    assert_eq!(resp.status_code, 200);

    let resp = peer.request("RECORD", &url, &[("Session", &token)]);
    assert_eq!(resp.status_code, 200);
    assert_eq!(hub.describe("live/cam2").as_deref(), Some(AV_SDP));
    assert_eq!(
        server.registry().get(&token).unwrap().state(),
        SessionState::Recording
    );

    // A second publisher for the same path is refused.
    let mut rival = Peer::connect(&base);
    let resp = rival.send("ANNOUNCE", &url, &[], Some(AV_SDP));
    assert_eq!(resp.status_code, 406);

    let sink = Arc::new(Collect::default());
    hub.subscribe("live/cam2", "collector", sink.clone()).unwrap();
    peer.send_frame(2, &[0x80, 97, 0, 1]);
    peer.send_frame(1, &[0x81]);
    assert!(wait_until(IO_TIMEOUT, || sink.0.lock().len() == 2));
    {
        let packets = sink.0.lock();
        assert_eq!(packets[0], MediaPacket::rtp(TrackKind::Audio, vec![0x80, 97, 0, 1]));
        assert_eq!(packets[1].track, TrackKind::Video);
        assert_eq!(packets[1].kind, PacketKind::Rtcp);
    }

    drop(peer);
    assert!(wait_until(IO_TIMEOUT, || !hub.has_publisher("live/cam2")));
}

#[test]
fn digest_challenge_and_response() {
    let hub = Arc::new(StreamHub::new());
    let mut server = Server::new(test_config(), hub.clone()).with_authenticator(Arc::new(
        StaticAuthenticator::new().with_user("admin", "secret"),
    ));
    server.start().unwrap();
    let base = format!("rtsp://{}", server.local_addr().unwrap());
    hub.publish("cam1", AV_SDP).unwrap();
    let url = format!("{base}/cam1");
    let mut peer = Peer::connect(&base);

    let resp = peer.request("OPTIONS", &url, &[]);
    assert_eq!(resp.status_code, 200);

    let resp = peer.request("DESCRIBE", &url, &[]);
    assert_eq!(resp.status_code, 401);
    assert_eq!(resp.get_headers("WWW-Authenticate").count(), 2);
    let challenge = Challenge::select(resp.get_headers("WWW-Authenticate")).unwrap();
    assert!(matches!(challenge, Challenge::Digest { .. }));

    let wrong = challenge.authorization("admin", "guess", "DESCRIBE", &url);
    let resp = peer.request("DESCRIBE", &url, &[("Authorization", &wrong)]);
    assert_eq!(resp.status_code, 401);

    let right = challenge.authorization("admin", "secret", "DESCRIBE", &url);
    let resp = peer.request("DESCRIBE", &url, &[("Authorization", &right)]);
    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.body.as_deref(), Some(AV_SDP));

    // The response is bound to the URI it was computed for.
    let resp = peer.request("DESCRIBE", &format!("{base}/cam2"), &[("Authorization", &right)]);
    assert_eq!(resp.status_code, 401);
}

#[test]
fn pull_between_two_servers() {
    let (_upstream, upstream_hub, upstream_base) = start_server(test_config());
    upstream_hub.publish("cam1", AV_SDP).unwrap();

    let (downstream, downstream_hub, _) = start_server(test_config());
    let session = downstream
        .pull_stream("/cam1", Some(&format!("{upstream_base}/cam1")))
        .expect("pull");
    assert_eq!(downstream_hub.describe("cam1").as_deref(), Some(AV_SDP));
    assert_eq!(session.state(), SessionState::Playing);
    assert!(downstream.registry().get(&session.id).is_some());

    let sink = Arc::new(Collect::default());
    downstream_hub.subscribe("cam1", "viewer", sink.clone()).unwrap();
    upstream_hub.forward("cam1", &MediaPacket::rtp(TrackKind::Video, vec![9, 9, 9]));
    assert!(wait_until(IO_TIMEOUT, || !sink.0.lock().is_empty()));
    assert_eq!(
        sink.0.lock()[0],
        MediaPacket::rtp(TrackKind::Video, vec![9, 9, 9])
    );
}

#[test]
fn pull_status_reports_outcome() {
    let (_upstream, upstream_hub, upstream_base) = start_server(test_config());
    upstream_hub.publish("cam1", AV_SDP).unwrap();
    let (downstream, _hub, _) = start_server(test_config());

    let ok = downstream.pull_status("cam1", &format!("{upstream_base}/cam1"));
    assert_eq!(ok.to_json().unwrap(), r#"{"code":0}"#);

    let missing = downstream.pull_status("cam9", &format!("{upstream_base}/cam9"));
    assert_eq!(missing.code, 1);
    assert!(missing.msg.unwrap().contains("404"));
}

fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn unreachable_pull_publishes_nothing() {
    let (server, hub, _) = start_server(test_config());
    let target = format!("rtsp://127.0.0.1:{}/camZ", unused_port());

    assert!(server.pull_stream("camZ", Some(&target)).is_err());
    assert!(!hub.has_publisher("camZ"));
    assert!(server.registry().is_empty());
}

#[test]
fn unreachable_pull_schedules_reconnect() {
    let config = ServerConfig {
        reconnect: true,
        reconnect_attempts: 50,
        reconnect_interval_ms: 100,
        ..test_config()
    };
    let (server, hub, _) = start_server(config);
    let port = unused_port();
    let target = format!("rtsp://127.0.0.1:{port}/camR");

    assert!(server.pull_stream("camR", Some(&target)).is_err());
    assert!(!hub.has_publisher("camR"));

    // The retry shows up as a new connection once something listens.
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    listener.set_nonblocking(true).unwrap();
    let accepted = wait_until(IO_TIMEOUT, || listener.accept().is_ok());
    assert!(accepted, "no reconnect attempt observed");
}

#[test]
fn auto_pull_connects_to_templated_url() {
    let fake = TcpListener::bind("127.0.0.1:0").unwrap();
    let fake_port = fake.local_addr().unwrap().port();

    let config = ServerConfig {
        auto_pull: true,
        remote_addr: format!("rtsp://127.0.0.1:{fake_port}/${{streamPath}}"),
        ..test_config()
    };
    let (_server, hub, _) = start_server(config);

    hub.subscribe("/camX", "viewer", Arc::new(Collect::default()))
        .unwrap();

    let (stream, _) = fake.accept().unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).unwrap();
    assert_eq!(
        line,
        format!("OPTIONS rtsp://127.0.0.1:{fake_port}/camX RTSP/1.0\r\n")
    );
}

#[test]
fn auto_pull_can_be_switched_off_at_runtime() {
    let fake = TcpListener::bind("127.0.0.1:0").unwrap();
    let fake_port = fake.local_addr().unwrap().port();
    fake.set_nonblocking(true).unwrap();

    let config = ServerConfig {
        auto_pull: true,
        remote_addr: format!("rtsp://127.0.0.1:{fake_port}/${{streamPath}}"),
        ..test_config()
    };
    let (server, hub, _) = start_server(config);
    server.set_auto_pull(false);

    hub.subscribe("camY", "viewer", Arc::new(Collect::default()))
        .unwrap();
    thread::sleep(Duration::from_millis(300));
    assert!(fake.accept().is_err());
}

#[test]
fn push_between_two_servers() {
    let (source, source_hub, _) = start_server(test_config());
    source_hub.publish("cam3", AV_SDP).unwrap();
    let (_target, target_hub, target_base) = start_server(test_config());

    let session = source
        .push_stream("cam3", Some(&format!("{target_base}/cam3")))
        .expect("push");
    assert_eq!(session.state(), SessionState::Recording);
    assert_eq!(target_hub.describe("cam3").as_deref(), Some(AV_SDP));

    let sink = Arc::new(Collect::default());
    target_hub.subscribe("cam3", "viewer", sink.clone()).unwrap();
    source_hub.forward("cam3", &MediaPacket::rtp(TrackKind::Audio, vec![7, 7]));
    assert!(wait_until(IO_TIMEOUT, || !sink.0.lock().is_empty()));
    assert_eq!(sink.0.lock()[0], MediaPacket::rtp(TrackKind::Audio, vec![7, 7]));
}

#[test]
fn push_without_publisher_fails() {
    let (source, _hub, _) = start_server(test_config());
    let (_target, _target_hub, target_base) = start_server(test_config());
    assert!(
        source
            .push_stream("nothing", Some(&format!("{target_base}/nothing")))
            .is_err()
    );
}

#[test]
fn stop_closes_live_sessions() {
    let (mut server, _hub, base) = start_server(test_config());
    let mut peer = Peer::connect(&base);
    peer.request("OPTIONS", &base, &[]);
    assert_eq!(server.registry().len(), 1);

    server.stop();
    assert!(!server.is_running());
    assert!(server.registry().is_empty());
    assert!(peer.is_closed());
}

#[test]
fn non_utf8_request_is_answered_and_session_continues() {
    let (server, _hub, base) = start_server(test_config());
    let mut peer = Peer::connect(&base);
    peer.writer
        .write_all(b"OPTIONS rtsp://h/\xff\xfe RTSP/1.0\r\nCSeq: 1\r\n\r\n")
        .unwrap();

    match read_message(&mut peer.reader).unwrap() {
        Some(Message::Response(r)) => assert_eq!(r.status_code, 400),
        other => panic!("expected response, got {other:?}"),
    }
    let resp = peer.request("OPTIONS", &base, &[]);
    assert_eq!(resp.status_code, 200);
    assert_eq!(server.registry().len(), 1);
}

#[test]
fn oversized_body_closes_the_session() {
    let (server, _hub, base) = start_server(test_config());
    let mut peer = Peer::connect(&base);
    let head = format!(
        "ANNOUNCE {base}/cam1 RTSP/1.0\r\nCSeq: 1\r\nContent-Type: application/sdp\r\nContent-Length: 2000000\r\n\r\n"
    );
    peer.writer.write_all(head.as_bytes()).unwrap();

    match read_message(&mut peer.reader).unwrap() {
        Some(Message::Response(r)) => assert_eq!(r.status_code, 400),
        other => panic!("expected response, got {other:?}"),
    }
    assert!(peer.is_closed());
    assert!(wait_until(IO_TIMEOUT, || server.registry().is_empty()));
}

#[test]
fn describe_pulls_unpublished_stream_when_auto_pull_is_on() {
    let (_upstream, upstream_hub, upstream_base) = start_server(test_config());
    upstream_hub.publish("camP", AV_SDP).unwrap();

    let config = ServerConfig {
        auto_pull: true,
        remote_addr: format!("{upstream_base}/${{streamPath}}"),
        ..test_config()
    };
    let (_server, hub, base) = start_server(config);
    let mut peer = Peer::connect(&base);

    let resp = peer.request("DESCRIBE", &format!("{base}/camP"), &[]);
    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.body.as_deref(), Some(AV_SDP));
    assert!(hub.has_publisher("camP"));

    // Paths the remote does not have still answer 404.
    let resp = peer.request("DESCRIBE", &format!("{base}/missing"), &[]);
    assert_eq!(resp.status_code, 404);
    assert!(!hub.has_publisher("missing"));
}

fn udp_pair() -> (UdpSocket, UdpSocket) {
    let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtcp = UdpSocket::bind("127.0.0.1:0").unwrap();
    rtp.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    rtcp.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    (rtp, rtcp)
}

fn client_port(pair: &(UdpSocket, UdpSocket)) -> String {
    format!(
        "client_port={}-{}",
        pair.0.local_addr().unwrap().port(),
        pair.1.local_addr().unwrap().port()
    )
}

fn server_ports(transport: &str) -> (u16, u16) {
    let value = transport
        .split(';')
        .find_map(|p| p.strip_prefix("server_port="))
        .expect("server_port in reply");
    let (rtp, rtcp) = value.split_once('-').unwrap();
    (rtp.parse().unwrap(), rtcp.parse().unwrap())
}

#[test]
fn udp_play_delivers_datagrams() {
    let (_server, hub, base) = start_server(test_config());
    hub.publish("cam1", AV_SDP).unwrap();
    let url = format!("{base}/cam1");
    let mut peer = Peer::connect(&base);
    let video = udp_pair();
    let audio = udp_pair();

    peer.request("DESCRIBE", &url, &[]);
    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=0"),
        &[("Transport", &format!("RTP/AVP;unicast;{}", client_port(&video)))],
    );
    assert_eq!(resp.status_code, 200);
    let transport = resp.get_header("Transport").unwrap().to_string();
    assert!(transport.contains(&client_port(&video)));
    let (server_rtp, server_rtcp) = server_ports(&transport);
    assert_eq!(server_rtp % 2, 0);
    assert_eq!(server_rtcp, server_rtp + 1);
    let token = resp.session_id().unwrap().to_string();

    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=1"),
        &[
            ("Transport", &format!("RTP/AVP;unicast;{}", client_port(&audio))),
            ("Session", &token),
        ],
    );
    assert_eq!(resp.status_code, 200);
    let resp = peer.request("PLAY", &url, &[("Session", &token)]);
    assert_eq!(resp.status_code, 200);

    hub.forward("cam1", &MediaPacket::rtp(TrackKind::Video, vec![1, 2, 3]));
    hub.forward("cam1", &MediaPacket::rtcp(TrackKind::Audio, vec![4]));
    let mut buf = [0u8; 64];
    let n = video.0.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[1, 2, 3]);
    let n = audio.1.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[4]);
}

#[test]
fn udp_record_receives_datagrams() {
    let (_server, hub, base) = start_server(test_config());
    let url = format!("{base}/cam5");
    let mut peer = Peer::connect(&base);
    let video = udp_pair();
    let audio = udp_pair();

    let resp = peer.send("ANNOUNCE", &url, &[("Content-Type", "application/sdp")], Some(AV_SDP));
    assert_eq!(resp.status_code, 200);
    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=0"),
        &[(
            "Transport",
            &format!("RTP/AVP;unicast;{};mode=record", client_port(&video)),
        )],
    );
    assert_eq!(resp.status_code, 200);
    let (server_rtp, _) = server_ports(resp.get_header("Transport").unwrap());
    let token = resp.session_id().unwrap().to_string();
    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=1"),
        &[
            (
                "Transport",
                &format!("RTP/AVP;unicast;{};mode=record", client_port(&audio)),
            ),
            ("Session", &token),
        ],
    );
    assert_eq!(resp.status_code, 200);
    let resp = peer.request("RECORD", &url, &[("Session", &token)]);
    assert_eq!(resp.status_code, 200);

    let sink = Arc::new(Collect::default());
    hub.subscribe("cam5", "collector", sink.clone()).unwrap();
    let received = wait_until(IO_TIMEOUT, || {
        video.0.send_to(&[5, 6], ("127.0.0.1", server_rtp)).unwrap();
        !sink.0.lock().is_empty()
    });
    assert!(received);
    assert_eq!(sink.0.lock()[0], MediaPacket::rtp(TrackKind::Video, vec![5, 6]));
}

#[test]
fn pull_reconnects_after_upstream_drops_it() {
    let (upstream, upstream_hub, upstream_base) = start_server(test_config());
    upstream_hub.publish("cam1", AV_SDP).unwrap();

    let config = ServerConfig {
        reconnect: true,
        reconnect_attempts: 50,
        reconnect_interval_ms: 100,
        ..test_config()
    };
    let (downstream, downstream_hub, _) = start_server(config);
    let first = downstream
        .pull_stream("cam1", Some(&format!("{upstream_base}/cam1")))
        .expect("pull");

    let upstream_sessions = upstream.registry().by_stream("cam1");
    assert_eq!(upstream_sessions.len(), 1);
    upstream_sessions[0].teardown(upstream.context(), "dropped by test");

    let reconnected = wait_until(IO_TIMEOUT, || {
        downstream_hub.has_publisher("cam1")
            && downstream
                .registry()
                .sessions()
                .iter()
                .any(|s| s.id != first.id && s.state() == SessionState::Playing)
    });
    assert!(reconnected, "pull was not re-established");
    assert!(first.is_closed());
}

#[test]
fn teardown_policy_closes_session_on_failed_setup() {
    let config = ServerConfig {
        setup_failure: SetupFailurePolicy::TeardownSession,
        ..test_config()
    };
    let (server, hub, base) = start_server(config);
    hub.publish("cam1", AV_SDP).unwrap();
    let url = format!("{base}/cam1");
    let mut peer = Peer::connect(&base);

    peer.request("DESCRIBE", &url, &[]);
    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=0"),
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
    );
    let token = resp.session_id().unwrap().to_string();
    let resp = peer.request(
        "SETUP",
        &format!("{url}/trackID=1"),
        &[
            ("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1"),
            ("Session", &token),
        ],
    );
    assert_eq!(resp.status_code, 461);
    assert!(peer.is_closed());
    assert!(wait_until(IO_TIMEOUT, || server.registry().is_empty()));
}
