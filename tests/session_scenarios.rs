//! End-to-end session scenarios against a scripted trunk
//!
//! The engine runs on a `MemoryTransport`; the test plays the trunk through
//! the matching `MemoryPeer`.

use sipdialer::config::{Config, SipTrunkConfig};
use sipdialer::infrastructure::protocols::sip::auth::{challenge_response, DigestAlgorithm};
use sipdialer::infrastructure::protocols::sip::{
    make_header, memory_pair, MemoryPeer, RequestBuilder, ResponseBuilder, SipMethod, SipRequest, SipResponse,
};
use sipdialer::{
    CallInitiator, CallState, RegistrationState, SessionError, SessionEvent, SessionEventKind,
    SipSession,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{timeout, Instant};

const NUMBER: &str = "15551234567";

fn trunk_config() -> Config {
    Config {
        sip: SipTrunkConfig {
            host: "127.0.0.1".to_string(),
            port: 5060,
            username: "1001".to_string(),
            password: "s3cret".to_string(),
            domain: "magnus".to_string(),
            caller_id: "Front Desk".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn start(config: Config) -> (SipSession, MemoryPeer, broadcast::Receiver<SessionEvent>) {
    let (transport, peer) = memory_pair(
        "127.0.0.1:5070".parse().unwrap(),
        "127.0.0.1:5060".parse().unwrap(),
    );
    let session = SipSession::start(config, transport).await.unwrap();
    let events = session.subscribe();
    (session, peer, events)
}

async fn next_kind(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEventKind {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event within 5s")
        .expect("event channel closed")
        .kind
}

async fn next_request(peer: &mut MemoryPeer) -> SipRequest {
    timeout(Duration::from_secs(5), peer.recv_request())
        .await
        .expect("no request within 5s")
        .expect("engine sent something that is not a request")
}

fn ok_for(request: &SipRequest) -> SipResponse {
    ResponseBuilder::ok().to_tag("trunk").build_for_request(request)
}

/// Start an engine and complete an unchallenged registration
async fn registered() -> (SipSession, MemoryPeer, broadcast::Receiver<SessionEvent>) {
    let (session, mut peer, mut events) = start(trunk_config()).await;
    session.register().await.unwrap();
    assert_eq!(next_kind(&mut events).await, SessionEventKind::Registering);

    let register = next_request(&mut peer).await;
    peer.send_response(&ok_for(&register)).await.unwrap();
    assert!(matches!(
        next_kind(&mut events).await,
        SessionEventKind::Connected { .. }
    ));
    (session, peer, events)
}

/// Dial and answer with 180 then 200; returns the INVITE and the 200
async fn established(
    session: &SipSession,
    peer: &mut MemoryPeer,
    events: &mut broadcast::Receiver<SessionEvent>,
) -> (SipRequest, SipResponse) {
    session.place_call(NUMBER).await.unwrap();
    assert!(matches!(
        next_kind(events).await,
        SessionEventKind::CallInitiated { .. }
    ));

    let invite = next_request(peer).await;
    let ringing = ResponseBuilder::new(180)
        .to_tag("callee")
        .build_for_request(&invite);
    peer.send_response(&ringing).await.unwrap();
    assert!(matches!(
        next_kind(events).await,
        SessionEventKind::CallRinging { .. }
    ));

    let answer = ResponseBuilder::ok()
        .to_tag("callee")
        .header("Contact", format!("<sip:{}@127.0.0.1:5060>", NUMBER))
        .build_for_request(&invite);
    peer.send_response(&answer).await.unwrap();
    assert!(matches!(
        next_kind(events).await,
        SessionEventKind::CallEstablished { .. }
    ));

    let ack = next_request(peer).await;
    assert_eq!(ack.method(), SipMethod::Ack);
    (invite, answer)
}

/// Round-trip an inbound OPTIONS so every earlier datagram has been handled
async fn sync_with_engine(peer: &mut MemoryPeer) -> SipResponse {
    let options = RequestBuilder::new(SipMethod::Options, "sip:1001@127.0.0.1:5070")
        .via("127.0.0.1:5060")
        .from("<sip:trunk@127.0.0.1>;tag=keepalive")
        .to("<sip:1001@magnus>")
        .call_id("keepalive-1")
        .cseq(1)
        .build()
        .unwrap();
    peer.send_request(&options).await.unwrap();
    timeout(Duration::from_secs(5), peer.recv_response())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn register_emits_connected_exactly_once() {
    let (session, mut peer, mut events) = start(trunk_config()).await;
    session.register().await.unwrap();
    assert_eq!(next_kind(&mut events).await, SessionEventKind::Registering);

    let register = next_request(&mut peer).await;
    assert_eq!(register.method(), SipMethod::Register);
    assert_eq!(register.uri().to_string(), "sip:127.0.0.1:5060");
    assert_eq!(register.cseq(), Some((1, SipMethod::Register)));
    assert_eq!(register.header("Expires").as_deref(), Some("300"));
    assert!(register
        .header("Authorization")
        .unwrap()
        .contains(r#"response="""#));
    assert_eq!(register.header("To").as_deref(), Some("<sip:1001@magnus>"));

    peer.send_response(&ok_for(&register)).await.unwrap();
    assert_eq!(
        next_kind(&mut events).await,
        SessionEventKind::Connected { expires: 300 }
    );

    sync_with_engine(&mut peer).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    let status = session.status().await.unwrap();
    assert_eq!(status.registration, RegistrationState::Registered);
    assert_eq!(status.registration_expires, Some(300));
    assert_eq!(status.call_state, CallState::Idle);
}

#[tokio::test]
async fn register_answers_digest_challenge_once() {
    let (session, mut peer, mut events) = start(trunk_config()).await;
    session.register().await.unwrap();
    assert_eq!(next_kind(&mut events).await, SessionEventKind::Registering);

    let first = next_request(&mut peer).await;
    let challenge = ResponseBuilder::new(401)
        .to_tag("trunk")
        .header(
            "WWW-Authenticate",
            r#"Digest realm="magnus", nonce="abc123nonce", algorithm=MD5"#,
        )
        .build_for_request(&first);
    peer.send_response(&challenge).await.unwrap();

    let second = next_request(&mut peer).await;
    assert_eq!(second.call_id(), first.call_id());
    assert_eq!(second.cseq(), Some((2, SipMethod::Register)));
    assert_ne!(second.branch(), first.branch());

    let expected = challenge_response(
        DigestAlgorithm::Md5,
        "1001",
        "magnus",
        "s3cret",
        "REGISTER",
        "sip:127.0.0.1:5060",
        "abc123nonce",
    );
    let authorization = second.header("Authorization").unwrap();
    assert!(authorization.contains(&format!(r#"response="{}""#, expected)));
    assert!(authorization.contains(r#"username="1001""#));

    let granted = ResponseBuilder::ok()
        .to_tag("trunk")
        .header("Expires", "120")
        .build_for_request(&second);
    peer.send_response(&granted).await.unwrap();
    assert_eq!(
        next_kind(&mut events).await,
        SessionEventKind::Connected { expires: 120 }
    );
    assert_eq!(
        session.status().await.unwrap().registration_expires,
        Some(120)
    );
}

#[tokio::test]
async fn register_fails_when_challenged_twice() {
    let (session, mut peer, mut events) = start(trunk_config()).await;
    session.register().await.unwrap();
    next_kind(&mut events).await;

    for _ in 0..2 {
        let request = next_request(&mut peer).await;
        let challenge = ResponseBuilder::new(401)
            .to_tag("trunk")
            .header("WWW-Authenticate", r#"Digest realm="magnus", nonce="n1""#)
            .build_for_request(&request);
        peer.send_response(&challenge).await.unwrap();
    }

    match next_kind(&mut events).await {
        SessionEventKind::RegistrationFailed { reason } => {
            assert!(reason.contains("authentication"), "{}", reason)
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(peer.try_recv().is_none());
    assert_eq!(
        session.status().await.unwrap().registration,
        RegistrationState::Unregistered
    );
}

#[tokio::test]
async fn register_forbidden_reports_reason() {
    let (session, mut peer, mut events) = start(trunk_config()).await;
    session.register().await.unwrap();
    next_kind(&mut events).await;

    let request = next_request(&mut peer).await;
    let forbidden = ResponseBuilder::new(403).to_tag("t").build_for_request(&request);
    peer.send_response(&forbidden).await.unwrap();

    match next_kind(&mut events).await {
        SessionEventKind::RegistrationFailed { reason } => assert!(reason.contains("forbidden")),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn register_in_flight_is_joined() {
    let (session, mut peer, mut events) = start(trunk_config()).await;
    session.register().await.unwrap();
    session.register().await.unwrap();

    let register = next_request(&mut peer).await;
    assert!(peer.try_recv().is_none());

    assert_eq!(next_kind(&mut events).await, SessionEventKind::Registering);
    peer.send_response(&ok_for(&register)).await.unwrap();
    assert!(matches!(
        next_kind(&mut events).await,
        SessionEventKind::Connected { .. }
    ));
}

#[tokio::test]
async fn register_with_missing_settings_sends_nothing() {
    let mut config = trunk_config();
    config.sip.password.clear();
    let (session, mut peer, mut events) = start(config).await;

    let err = session.register().await.unwrap_err();
    assert!(matches!(err, SessionError::Configuration(_)));
    assert!(peer.try_recv().is_none());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn register_response_rewrites_contact_from_via() {
    let (session, mut peer, mut events) = start(trunk_config()).await;
    session.register().await.unwrap();
    next_kind(&mut events).await;

    let register = next_request(&mut peer).await;
    let mut response = ok_for(&register);
    let via = response
        .header("Via")
        .unwrap()
        .replace(";rport", ";rport=40123;received=203.0.113.9");
    let headers = response.headers_mut();
    headers.retain(|header| !matches!(header, rsip::Header::Via(_)));
    headers.push(make_header("Via", via));
    peer.send_response(&response).await.unwrap();
    next_kind(&mut events).await;

    let status = session.status().await.unwrap();
    assert_eq!(status.contact, "sip:1001@203.0.113.9:40123");

    session.place_call(NUMBER).await.unwrap();
    let invite = next_request(&mut peer).await;
    assert!(invite.header("Via").unwrap().contains("203.0.113.9:40123"));
    assert_eq!(
        invite.header("Contact").as_deref(),
        Some("<sip:1001@203.0.113.9:40123>")
    );
}

#[tokio::test]
async fn place_call_requires_registration() {
    let (session, mut peer, mut events) = start(trunk_config()).await;

    assert_eq!(
        session.place_call(NUMBER).await.unwrap_err(),
        SessionError::NotRegistered(RegistrationState::Unregistered)
    );
    assert!(peer.try_recv().is_none());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn call_rings_then_establishes() {
    let (session, mut peer, mut events) = registered().await;

    let handle = session.place_call(NUMBER).await.unwrap();
    assert_eq!(handle.destination, NUMBER);
    assert_eq!(handle.state, CallState::Inviting);
    assert_eq!(
        next_kind(&mut events).await,
        SessionEventKind::CallInitiated {
            call_id: handle.call_id.clone(),
            destination: NUMBER.to_string(),
        }
    );

    let invite = next_request(&mut peer).await;
    assert_eq!(invite.uri().to_string(), format!("sip:{}@127.0.0.1", NUMBER));
    assert_eq!(invite.call_id(), Some(handle.call_id.as_str()));
    assert_eq!(invite.header("Content-Type").as_deref(), Some("application/sdp"));
    assert!(invite.body_str().contains("m=audio 8000 RTP/AVP 0 8 101"));
    assert!(invite.header("From").unwrap().starts_with("\"Front Desk\""));

    // 100 already moves the call to ringing; the 180 after it adds no event
    let trying = ResponseBuilder::new(100).build_for_request(&invite);
    peer.send_response(&trying).await.unwrap();
    let ringing = ResponseBuilder::new(180)
        .to_tag("callee")
        .build_for_request(&invite);
    peer.send_response(&ringing).await.unwrap();
    assert_eq!(
        next_kind(&mut events).await,
        SessionEventKind::CallRinging {
            call_id: handle.call_id.clone(),
            destination: NUMBER.to_string(),
        }
    );

    let answer = ResponseBuilder::ok()
        .to_tag("callee")
        .header("Contact", "<sip:callee@127.0.0.1:5060>")
        .build_for_request(&invite);
    peer.send_response(&answer).await.unwrap();
    assert_eq!(
        next_kind(&mut events).await,
        SessionEventKind::CallEstablished {
            call_id: handle.call_id.clone(),
            destination: NUMBER.to_string(),
        }
    );

    let ack = next_request(&mut peer).await;
    assert_eq!(ack.method(), SipMethod::Ack);
    assert_eq!(ack.uri().to_string(), "sip:callee@127.0.0.1:5060");
    assert_eq!(ack.cseq(), Some((1, SipMethod::Ack)));
    assert_eq!(ack.to_tag().as_deref(), Some("callee"));
    assert_ne!(ack.branch(), invite.branch());

    let status = session.status().await.unwrap();
    assert_eq!(status.call_state, CallState::Established);
    assert_eq!(status.destination.as_deref(), Some(NUMBER));
    assert!(status.call_duration.is_some());

    // A retransmitted 200 gets another ACK and no new event
    peer.send_response(&answer).await.unwrap();
    assert_eq!(next_request(&mut peer).await.method(), SipMethod::Ack);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn trying_alone_counts_as_ringing() {
    let (session, mut peer, mut events) = registered().await;
    let handle = session.place_call(NUMBER).await.unwrap();
    next_kind(&mut events).await;

    let invite = next_request(&mut peer).await;
    let trying = ResponseBuilder::new(100).build_for_request(&invite);
    peer.send_response(&trying).await.unwrap();
    assert_eq!(
        next_kind(&mut events).await,
        SessionEventKind::CallRinging {
            call_id: handle.call_id.clone(),
            destination: NUMBER.to_string(),
        }
    );
    assert_eq!(session.status().await.unwrap().call_state, CallState::Ringing);

    let answer = ResponseBuilder::ok()
        .to_tag("callee")
        .header("Contact", "<sip:callee@127.0.0.1:5060>")
        .build_for_request(&invite);
    peer.send_response(&answer).await.unwrap();
    assert_eq!(
        next_kind(&mut events).await,
        SessionEventKind::CallEstablished {
            call_id: handle.call_id,
            destination: NUMBER.to_string(),
        }
    );
    assert_eq!(next_request(&mut peer).await.method(), SipMethod::Ack);
}

#[tokio::test]
async fn second_call_is_rejected_while_active() {
    let (session, mut peer, mut events) = registered().await;
    session.place_call(NUMBER).await.unwrap();
    next_request(&mut peer).await;
    next_kind(&mut events).await;

    assert_eq!(
        session.place_call("15550000000").await.unwrap_err(),
        SessionError::CallInProgress(CallState::Inviting)
    );
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn busy_answer_is_acked_and_fails_the_call() {
    let (session, mut peer, mut events) = registered().await;
    session.place_call(NUMBER).await.unwrap();
    next_kind(&mut events).await;

    let invite = next_request(&mut peer).await;
    let busy = ResponseBuilder::new(486)
        .to_tag("callee")
        .build_for_request(&invite);
    peer.send_response(&busy).await.unwrap();

    match next_kind(&mut events).await {
        SessionEventKind::CallFailed { reason, .. } => assert_eq!(reason, "486 Busy Here"),
        other => panic!("unexpected event {:?}", other),
    }

    let ack = next_request(&mut peer).await;
    assert_eq!(ack.method(), SipMethod::Ack);
    assert_eq!(ack.branch(), invite.branch());
    assert_eq!(ack.to_tag().as_deref(), Some("callee"));

    // Failed is not active, so a new call may be placed
    assert_eq!(session.status().await.unwrap().call_state, CallState::Failed);
    session.place_call(NUMBER).await.unwrap();
}

#[tokio::test]
async fn invite_proxy_challenge_is_answered() {
    let (session, mut peer, mut events) = registered().await;
    session.place_call(NUMBER).await.unwrap();
    next_kind(&mut events).await;

    let invite = next_request(&mut peer).await;
    let challenge = ResponseBuilder::new(407)
        .to_tag("proxy")
        .header(
            "Proxy-Authenticate",
            r#"Digest realm="magnus", nonce="inv-nonce", qop="auth", opaque="xyz""#,
        )
        .build_for_request(&invite);
    peer.send_response(&challenge).await.unwrap();

    assert_eq!(next_request(&mut peer).await.method(), SipMethod::Ack);

    let retry = next_request(&mut peer).await;
    assert_eq!(retry.method(), SipMethod::Invite);
    assert_eq!(retry.call_id(), invite.call_id());
    assert_eq!(retry.cseq(), Some((2, SipMethod::Invite)));
    assert_eq!(retry.from_tag(), invite.from_tag());
    let authorization = retry.header("Proxy-Authorization").unwrap();
    assert!(authorization.contains("qop=auth"));
    assert!(authorization.contains("nc=00000001"));
    assert!(authorization.contains(r#"opaque="xyz""#));

    let answer = ResponseBuilder::ok()
        .to_tag("callee")
        .header("Contact", "<sip:callee@127.0.0.1:5060>")
        .build_for_request(&retry);
    peer.send_response(&answer).await.unwrap();
    assert!(matches!(
        next_kind(&mut events).await,
        SessionEventKind::CallEstablished { .. }
    ));
    assert_eq!(next_request(&mut peer).await.cseq(), Some((2, SipMethod::Ack)));
}

#[tokio::test(start_paused = true)]
async fn unanswered_invite_times_out_after_all_retransmissions() {
    let (session, mut peer, mut events) = registered().await;
    session.place_call(NUMBER).await.unwrap();
    assert!(matches!(
        next_kind(&mut events).await,
        SessionEventKind::CallInitiated { .. }
    ));

    let started = Instant::now();
    let mut invites = 0;
    let reason = loop {
        tokio::select! {
            biased;
            Some(request) = peer.recv_request() => {
                assert_eq!(request.method(), SipMethod::Invite);
                invites += 1;
            }
            event = events.recv() => match event.unwrap().kind {
                SessionEventKind::CallFailed { reason, .. } => break reason,
                other => panic!("unexpected event {:?}", other),
            },
        }
    };

    assert_eq!(invites, 7);
    assert!(reason.contains("timeout"), "{}", reason);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(63) && elapsed < Duration::from_secs(65));
    assert_eq!(session.status().await.unwrap().call_state, CallState::Failed);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(peer.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn late_answer_after_timeout_is_acked_then_released() {
    let (session, mut peer, mut events) = registered().await;
    session.place_call(NUMBER).await.unwrap();
    next_kind(&mut events).await;
    let invite = next_request(&mut peer).await;

    loop {
        tokio::select! {
            biased;
            Some(request) = peer.recv_request() => {
                assert_eq!(request.method(), SipMethod::Invite);
            }
            event = events.recv() => match event.unwrap().kind {
                SessionEventKind::CallFailed { .. } => break,
                other => panic!("unexpected event {:?}", other),
            },
        }
    }

    let answer = ResponseBuilder::ok()
        .to_tag("callee")
        .header("Contact", "<sip:callee@127.0.0.1:5060>")
        .build_for_request(&invite);
    peer.send_response(&answer).await.unwrap();

    let ack = next_request(&mut peer).await;
    assert_eq!(ack.method(), SipMethod::Ack);
    assert_eq!(ack.uri().to_string(), "sip:callee@127.0.0.1:5060");
    assert_eq!(ack.cseq(), Some((1, SipMethod::Ack)));
    assert_eq!(ack.to_tag().as_deref(), Some("callee"));

    let bye = next_request(&mut peer).await;
    assert_eq!(bye.method(), SipMethod::Bye);
    assert_eq!(bye.call_id(), invite.call_id());
    assert_eq!(bye.cseq(), Some((2, SipMethod::Bye)));
    assert_eq!(bye.from_tag(), invite.from_tag());
    assert_eq!(bye.to_tag().as_deref(), Some("callee"));
    peer.send_response(&ok_for(&bye)).await.unwrap();

    // A retransmission of the same answer is only ACKed again
    peer.send_response(&answer).await.unwrap();
    assert_eq!(next_request(&mut peer).await.method(), SipMethod::Ack);

    sync_with_engine(&mut peer).await;
    assert!(peer.try_recv().is_none());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(session.status().await.unwrap().call_state, CallState::Failed);
}

#[tokio::test(start_paused = true)]
async fn unanswered_register_fails_with_timeout() {
    let (session, mut peer, mut events) = start(trunk_config()).await;
    session.register().await.unwrap();
    assert_eq!(next_kind(&mut events).await, SessionEventKind::Registering);

    let mut registers = 0;
    let reason = loop {
        tokio::select! {
            biased;
            Some(_) = peer.recv_request() => registers += 1,
            event = events.recv() => match event.unwrap().kind {
                SessionEventKind::RegistrationFailed { reason } => break reason,
                other => panic!("unexpected event {:?}", other),
            },
        }
    };

    assert_eq!(registers, 7);
    assert!(reason.contains("timeout"), "{}", reason);
    assert_eq!(
        session.status().await.unwrap().registration,
        RegistrationState::Unregistered
    );
}

#[tokio::test]
async fn digits_are_sent_as_info_with_rising_cseq() {
    let (session, mut peer, mut events) = registered().await;
    let (invite, _) = established(&session, &mut peer, &mut events).await;

    session.send_digit('1').await.unwrap();
    let info = next_request(&mut peer).await;
    assert_eq!(info.method(), SipMethod::Info);
    assert_eq!(info.body_str(), "Signal=1\r\nDuration=100\r\n");
    assert_eq!(
        info.header("Content-Type").as_deref(),
        Some("application/dtmf-relay")
    );
    assert_eq!(info.cseq(), Some((2, SipMethod::Info)));
    assert_eq!(info.call_id(), invite.call_id());
    assert!(peer.try_recv().is_none());
    assert_eq!(
        next_kind(&mut events).await,
        SessionEventKind::DigitSent {
            call_id: invite.call_id().unwrap().to_string(),
            digit: '1',
        }
    );
    peer.send_response(&ok_for(&info)).await.unwrap();

    session.send_digit('#').await.unwrap();
    let second = next_request(&mut peer).await;
    assert_eq!(second.body_str(), "Signal=#\r\nDuration=100\r\n");
    assert_eq!(second.cseq(), Some((3, SipMethod::Info)));
    peer.send_response(&ok_for(&second)).await.unwrap();

    session.hang_up().await.unwrap();
    let bye = next_request(&mut peer).await;
    assert_eq!(bye.cseq(), Some((4, SipMethod::Bye)));
}

#[tokio::test]
async fn digit_without_call_is_rejected() {
    let (session, mut peer, mut events) = registered().await;

    assert_eq!(
        session.send_digit('1').await.unwrap_err(),
        SessionError::NoEstablishedCall(CallState::Idle)
    );
    assert_eq!(
        session.send_digit('x').await.unwrap_err(),
        SessionError::InvalidDigit('x')
    );
    assert!(peer.try_recv().is_none());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn local_hang_up_ends_call() {
    let (session, mut peer, mut events) = registered().await;
    let (invite, _) = established(&session, &mut peer, &mut events).await;

    session.hang_up().await.unwrap();
    assert!(matches!(
        next_kind(&mut events).await,
        SessionEventKind::CallTerminating { .. }
    ));
    assert_eq!(
        session.status().await.unwrap().call_state,
        CallState::Terminating
    );

    let bye = next_request(&mut peer).await;
    assert_eq!(bye.method(), SipMethod::Bye);
    assert_eq!(bye.from_tag(), invite.from_tag());
    assert_eq!(bye.to_tag().as_deref(), Some("callee"));
    peer.send_response(&ok_for(&bye)).await.unwrap();

    assert_eq!(
        next_kind(&mut events).await,
        SessionEventKind::CallEnded {
            call_id: invite.call_id().unwrap().to_string(),
            destination: NUMBER.to_string(),
            initiator: CallInitiator::Local,
        }
    );
    assert_eq!(
        session.status().await.unwrap().call_state,
        CallState::Terminated
    );
}

#[tokio::test]
async fn remote_bye_ends_call() {
    let (session, mut peer, mut events) = registered().await;
    let (invite, answer) = established(&session, &mut peer, &mut events).await;

    let bye = RequestBuilder::new(SipMethod::Bye, "sip:1001@127.0.0.1:5070")
        .via("127.0.0.1:5060")
        .from(answer.header("To").unwrap())
        .to(invite.header("From").unwrap())
        .call_id(invite.call_id().unwrap())
        .cseq(1)
        .build()
        .unwrap();
    peer.send_request(&bye).await.unwrap();

    let response = timeout(Duration::from_secs(5), peer.recv_response())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.cseq(), Some((1, SipMethod::Bye)));

    match next_kind(&mut events).await {
        SessionEventKind::CallEnded { initiator, .. } => {
            assert_eq!(initiator, CallInitiator::Remote)
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(
        session.hang_up().await.unwrap_err(),
        SessionError::NoEstablishedCall(CallState::Terminated)
    );
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn unmatched_response_changes_nothing() {
    let (session, mut peer, mut events) = registered().await;

    let stray = RequestBuilder::new(SipMethod::Register, "sip:127.0.0.1:5060")
        .via("127.0.0.1:5070")
        .from("<sip:1001@magnus>;tag=old")
        .to("<sip:1001@magnus>")
        .call_id("nobody-knows-this")
        .cseq(99)
        .build()
        .unwrap();
    peer.send_response(&ok_for(&stray)).await.unwrap();
    peer.deliver("definitely not SIP").await.unwrap();

    let options_answer = sync_with_engine(&mut peer).await;
    assert_eq!(options_answer.status_code(), 200);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    let status = session.status().await.unwrap();
    assert_eq!(status.registration, RegistrationState::Registered);
    assert_eq!(status.call_state, CallState::Idle);
}

#[tokio::test]
async fn inbound_requests_get_fixed_answers() {
    let (_session, mut peer, _events) = registered().await;

    let options = sync_with_engine(&mut peer).await;
    assert_eq!(options.status_code(), 200);
    assert!(options.header("Allow").unwrap().contains("INFO"));

    let request = |method: SipMethod, call_id: &str| {
        RequestBuilder::new(method, "sip:1001@127.0.0.1:5070")
            .via("127.0.0.1:5060")
            .from("<sip:caller@127.0.0.1>;tag=abc")
            .to("<sip:1001@magnus>")
            .call_id(call_id)
            .cseq(1)
            .build()
            .unwrap()
    };

    let cases = [
        (SipMethod::Bye, 481),
        (SipMethod::Invite, 603),
        (SipMethod::Subscribe, 501),
    ];
    for (method, expected) in cases {
        peer.send_request(&request(method, "stranger")).await.unwrap();
        let response = timeout(Duration::from_secs(5), peer.recv_response())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status_code(), expected, "{}", method);
    }
}

#[tokio::test]
async fn test_connection_reports_reachability() {
    let (session, mut peer, mut events) = start(trunk_config()).await;

    session.test_connection().await.unwrap();
    let options = next_request(&mut peer).await;
    assert_eq!(options.method(), SipMethod::Options);

    peer.send_response(&ok_for(&options)).await.unwrap();
    assert_eq!(
        next_kind(&mut events).await,
        SessionEventKind::ConnectionTested {
            reachable: true,
            status: Some(200),
        }
    );
}

#[tokio::test]
async fn disconnect_hangs_up_and_stops_engine() {
    let (session, mut peer, mut events) = registered().await;
    established(&session, &mut peer, &mut events).await;

    session.disconnect().await.unwrap();

    assert_eq!(next_request(&mut peer).await.method(), SipMethod::Bye);
    assert!(matches!(
        next_kind(&mut events).await,
        SessionEventKind::CallEnded {
            initiator: CallInitiator::Local,
            ..
        }
    ));
    assert_eq!(next_kind(&mut events).await, SessionEventKind::Disconnected);
    assert!(!peer.is_open());

    assert_eq!(session.register().await, Err(SessionError::Stopped));
    assert_eq!(session.status().await.unwrap_err(), SessionError::Stopped);
}
