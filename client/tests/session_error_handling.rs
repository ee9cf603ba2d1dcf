//! End-to-end session tests against a scripted loopback server.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tether_client::{Client, SessionNotice, SessionObserver, SocketConnector, ThreadDispatcher};
use tether_shared::{
    auth_codes, decode_upstream, millis_now, AuthResponseData, Credentials, DObjectSnapshot,
    DownstreamMessage, DValue, FrameReader, PongResponse, UpstreamMessage, WireWriter,
};

#[derive(Default)]
struct RecordingObserver {
    notices: Mutex<Vec<String>>,
}

impl RecordingObserver {
    fn labels(&self) -> Vec<String> {
        self.notices.lock().unwrap().clone()
    }

    fn saw(&self, label: &str) -> bool {
        self.labels().iter().any(|seen| seen == label)
    }
}

impl SessionObserver for RecordingObserver {
    fn notify(&self, _client: &Client, notice: &SessionNotice) {
        let label = match notice {
            SessionNotice::WillLogon => "will_logon".to_string(),
            SessionNotice::DidLogon => "did_logon".to_string(),
            SessionNotice::ObjectChanged => "object_changed".to_string(),
            SessionNotice::DidLogoff => "did_logoff".to_string(),
            SessionNotice::ConnectionFailed { .. } => "connection_failed".to_string(),
            SessionNotice::FailedToLogon { cause } => format!(
                "failed_to_logon:{}:{}",
                cause.code, cause.still_in_progress
            ),
            SessionNotice::DidClear => "did_clear".to_string(),
        };
        self.notices.lock().unwrap().push(label);
    }
}

fn send_down(stream: &mut TcpStream, message: &DownstreamMessage) {
    let mut writer = WireWriter::new();
    message.ser(&mut writer);
    let body = writer.into_bytes();
    stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .unwrap();
    stream.write_all(&body).unwrap();
}

fn read_up(frames: &mut FrameReader, stream: &mut TcpStream) -> UpstreamMessage {
    decode_upstream(&frames.read_frame(stream).unwrap()).unwrap()
}

fn client_object_snapshot(oid: i32) -> DObjectSnapshot {
    DObjectSnapshot {
        oid,
        category: "session/body".into(),
        attributes: vec![("name".into(), DValue::Str("tester".into()))],
    }
}

/// Accepts one session and answers it until logoff: auth, bootstrap, then
/// pongs and object responses on demand.
fn run_scripted_server(listener: TcpListener) -> thread::JoinHandle<Vec<UpstreamMessage>> {
    thread::spawn(move || {
        let (mut stream, _addr) = listener.accept().unwrap();
        let mut frames = FrameReader::new();
        let mut seen = Vec::new();

        match read_up(&mut frames, &mut stream) {
            UpstreamMessage::AuthRequest { credentials, .. } => {
                assert_eq!(credentials.username, "tester");
            }
            other => panic!("expected auth request, got {other:?}"),
        }
        send_down(
            &mut stream,
            &DownstreamMessage::AuthResponse {
                data: AuthResponseData::success(),
            },
        );
        send_down(
            &mut stream,
            &DownstreamMessage::Bootstrap {
                connection_id: 7,
                client_oid: 1,
                payload: b"hello".to_vec(),
            },
        );

        loop {
            let message = read_up(&mut frames, &mut stream);
            seen.push(message.clone());
            match message {
                UpstreamMessage::Ping => send_down(
                    &mut stream,
                    &DownstreamMessage::Pong(PongResponse {
                        pack_stamp: millis_now(),
                        process_delay: 0,
                        unpack_stamp: 0,
                    }),
                ),
                UpstreamMessage::Subscribe { oid } => send_down(
                    &mut stream,
                    &DownstreamMessage::ObjectResponse {
                        object: client_object_snapshot(oid),
                    },
                ),
                UpstreamMessage::Logoff => break,
                // receiver publications and the like need no answer
                _ => {}
            }
        }
        seen
    })
}

fn test_client(host: &str, ports: Vec<u16>) -> (Client, Arc<RecordingObserver>) {
    let client = Client::with_parts(Arc::new(ThreadDispatcher::new()), Arc::new(SocketConnector));
    client.set_server(host, ports, vec![]);
    client.set_credentials(Credentials::new("tester", "sekrit"));
    client.set_version("1");
    let observer = Arc::new(RecordingObserver::default());
    client.add_observer(observer.clone());
    (client, observer)
}

fn await_true(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn clean_logon_and_logoff() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = run_scripted_server(listener);

    let (client, observer) = test_client("127.0.0.1", vec![port]);
    client.logon().unwrap();

    await_true("logon", || client.is_logged_on());
    assert_eq!(client.connection_id(), Some(7));
    assert_eq!(client.client_oid(), Some(1));
    assert_eq!(client.bootstrap_payload(), b"hello".to_vec());
    let body = client.client_object().unwrap();
    assert_eq!(body.get("name"), Some(DValue::Str("tester".into())));

    assert!(client.logoff(false));
    await_true("teardown", || observer.saw("did_clear"));

    let labels = observer.labels();
    let position = |label: &str| labels.iter().position(|seen| seen == label).unwrap();
    assert!(position("will_logon") < position("did_logon"));
    assert!(position("did_logon") < position("did_logoff"));
    assert!(position("did_logoff") < position("did_clear"));
    assert!(!observer.saw("connection_failed"));

    // a second logoff on a closed session is a successful no-op
    assert!(client.logoff(false));

    let seen = server.join().unwrap();
    assert!(seen.contains(&UpstreamMessage::Subscribe { oid: 1 }));
    assert!(seen.iter().any(|m| matches!(m, UpstreamMessage::Ping)));
}

#[test]
fn double_logon_is_a_local_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = run_scripted_server(listener);

    let (client, observer) = test_client("127.0.0.1", vec![port]);
    client.logon().unwrap();
    assert!(client.logon().is_err());

    await_true("logon", || client.is_logged_on());
    client.logoff(false);
    await_true("teardown", || observer.saw("did_clear"));
    server.join().unwrap();
}

#[test]
fn refused_port_reports_a_tribulation_and_the_next_port_succeeds() {
    // a port that was bound and released is almost certainly refusing
    let dead_port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let live_port = listener.local_addr().unwrap().port();
    let server = run_scripted_server(listener);

    let (client, observer) = test_client("127.0.0.1", vec![dead_port, live_port]);
    client.logon().unwrap();

    await_true("logon", || client.is_logged_on());
    assert!(observer.saw(&format!(
        "failed_to_logon:{}:true",
        auth_codes::TRYING_NEXT_PORT
    )));

    client.logoff(false);
    await_true("teardown", || observer.saw("did_clear"));
    server.join().unwrap();
}

#[test]
fn auth_refusal_is_a_terminal_logon_failure_after_cleanup() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _addr) = listener.accept().unwrap();
        let mut frames = FrameReader::new();
        match read_up(&mut frames, &mut stream) {
            UpstreamMessage::AuthRequest { .. } => {}
            other => panic!("expected auth request, got {other:?}"),
        }
        send_down(
            &mut stream,
            &DownstreamMessage::AuthResponse {
                data: AuthResponseData::failure(auth_codes::INVALID_CREDENTIALS),
            },
        );
    });

    let (client, observer) = test_client("127.0.0.1", vec![port]);
    client.logon().unwrap();

    let expected = format!("failed_to_logon:{}:false", auth_codes::INVALID_CREDENTIALS);
    await_true("terminal failure", || observer.saw(&expected));

    let labels = observer.labels();
    let clear = labels.iter().position(|seen| seen == "did_clear").unwrap();
    let failed = labels.iter().position(|seen| seen == &expected).unwrap();
    assert!(clear < failed, "the failure lands on a cleaned slate");
    assert!(!observer.saw("did_logon"));
    assert!(!observer.saw("did_logoff"));

    server.join().unwrap();
}

#[test]
fn connection_loss_while_live_reports_failure_then_one_logoff() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _addr) = listener.accept().unwrap();
        let mut frames = FrameReader::new();
        match read_up(&mut frames, &mut stream) {
            UpstreamMessage::AuthRequest { .. } => {}
            other => panic!("expected auth request, got {other:?}"),
        }
        send_down(
            &mut stream,
            &DownstreamMessage::AuthResponse {
                data: AuthResponseData::success(),
            },
        );
        send_down(
            &mut stream,
            &DownstreamMessage::Bootstrap {
                connection_id: 7,
                client_oid: 1,
                payload: Vec::new(),
            },
        );
        loop {
            match read_up(&mut frames, &mut stream) {
                UpstreamMessage::Ping => send_down(
                    &mut stream,
                    &DownstreamMessage::Pong(PongResponse {
                        pack_stamp: millis_now(),
                        process_delay: 0,
                        unpack_stamp: 0,
                    }),
                ),
                UpstreamMessage::Subscribe { oid } => {
                    send_down(
                        &mut stream,
                        &DownstreamMessage::ObjectResponse {
                            object: client_object_snapshot(oid),
                        },
                    );
                    // client object delivered; now die without warning
                    break;
                }
                _ => {}
            }
        }
    });

    let (client, observer) = test_client("127.0.0.1", vec![port]);
    client.logon().unwrap();
    // is_logged_on() is only true for the instant between the client object
    // arriving and the scripted disconnect tearing the session down, so
    // synchronize on the recorded notice rather than polling live state.
    await_true("logon", || observer.saw("did_logon"));
    server.join().unwrap();

    await_true("teardown", || observer.saw("did_clear"));
    let labels = observer.labels();
    let count = |label: &str| labels.iter().filter(|seen| *seen == label).count();
    assert_eq!(count("connection_failed"), 1);
    assert_eq!(count("did_logoff"), 1, "a live failure still ends in one logoff");
    let position = |label: &str| labels.iter().position(|seen| seen == label).unwrap();
    assert!(position("connection_failed") < position("did_logoff"));
}

#[test]
fn observer_veto_blocks_an_abortable_logoff() {
    struct Vetoer;
    impl SessionObserver for Vetoer {
        fn notify(&self, _client: &Client, _notice: &SessionNotice) {}
        fn will_logoff(&self, _client: &Client) -> bool {
            false
        }
    }

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = run_scripted_server(listener);

    let (client, observer) = test_client("127.0.0.1", vec![port]);
    client.add_observer(Arc::new(Vetoer));
    client.logon().unwrap();
    await_true("logon", || client.is_logged_on());

    assert!(!client.logoff(true), "vetoed");
    assert!(client.is_logged_on());

    assert!(client.logoff(false), "non-abortable ignores the veto");
    await_true("teardown", || observer.saw("did_clear"));
    server.join().unwrap();
}
