//! Integration tests for the TCP transport against in-process fake cluster members.
//!
//! Each fake member is a tokio `TcpListener` speaking the framed session protocol
//! directly, so these tests exercise connect, redirect, leader change, offers,
//! keep-alives and inbound messages over real sockets.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pulse_transport::codec;
use pulse_transport::protocol::{
    Frame, FrameCodec, NewLeaderBody, Opcode, SessionEventBody, SessionEventCode,
};
use pulse_transport::{
    ClusterTransport, IngressEndpoints, RecordingListener, SessionEvent, TcpTransport,
    TcpTransportConfig,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

type MemberConn = Framed<TcpStream, FrameCodec>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

async fn accept(listener: &TcpListener) -> MemberConn {
    let (stream, _) = listener.accept().await.unwrap();
    Framed::new(stream, FrameCodec::new())
}

async fn expect_frame(conn: &mut MemberConn, opcode: Opcode) -> Frame {
    let frame = tokio::time::timeout(Duration::from_secs(5), conn.next())
        .await
        .expect("member timed out waiting for frame")
        .expect("client closed connection")
        .expect("bad frame");
    assert_eq!(frame.opcode(), opcode);
    frame
}

fn ok_body(leader_member_id: u32, leadership_term_id: u64) -> SessionEventBody {
    SessionEventBody {
        code: SessionEventCode::Ok,
        leader_member_id,
        leadership_term_id,
        detail: String::new(),
    }
}

fn fast_config() -> TcpTransportConfig {
    TcpTransportConfig {
        connect_timeout_ms: 1000,
        response_timeout_ms: 1000,
        reconnect_delay_ms: 10,
        max_reconnect_delay_ms: 50,
        ..Default::default()
    }
}

async fn poll_until(
    transport: &mut TcpTransport,
    mut done: impl FnMut(&TcpTransport) -> bool,
) {
    for _ in 0..500 {
        transport.poll();
        if done(transport) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_session_open_offer_keep_alive_and_egress() {
    let (listener, addr) = bind().await;
    let request = codec::encode(codec::TX_REQUEST_TAG, 5);
    let expected = request.clone();

    let member = tokio::spawn(async move {
        let mut conn = accept(&listener).await;
        let connect = expect_frame(&mut conn, Opcode::SessionConnect).await;
        assert_eq!(connect.session_id(), 0);
        conn.send(Frame::session_event(77, &ok_body(0, 1))).await.unwrap();

        let msg = expect_frame(&mut conn, Opcode::Message).await;
        assert_eq!(msg.session_id(), 77);
        assert_eq!(msg.payload, expected);
        let keep_alive = expect_frame(&mut conn, Opcode::KeepAlive).await;
        assert_eq!(keep_alive.session_id(), 77);

        conn.send(Frame::message(77, codec::encode(0x00, 1))).await.unwrap();
        conn.send(Frame::error(77, "slow follower")).await.unwrap();
        let _ = conn.next().await;
    });

    let endpoints = IngressEndpoints::new([(0, addr)]).unwrap();
    let recorder = RecordingListener::new();
    let mut transport =
        TcpTransport::spawn(endpoints, fast_config(), Box::new(recorder.clone())).unwrap();

    poll_until(&mut transport, |t| t.is_connected()).await;
    assert_eq!(transport.cluster_session_id(), Some(77));
    assert_eq!(transport.leader_member_id(), Some(0));

    assert!(transport.offer(&request).is_accepted());
    assert!(transport.send_keep_alive());

    let watcher = recorder.clone();
    poll_until(&mut transport, |_| {
        watcher.count(|e| matches!(e, SessionEvent::Error { .. })) == 1
    })
    .await;

    let events = recorder.events();
    assert!(events.contains(&SessionEvent::Connected {
        session_id: 77,
        leader_member_id: 0
    }));
    assert!(events.contains(&SessionEvent::Message {
        session_id: 77,
        payload: codec::encode(0x00, 1).to_vec()
    }));
    assert!(events.contains(&SessionEvent::Error {
        details: "slow follower".to_string()
    }));

    drop(transport);
    member.await.unwrap();
}

#[tokio::test]
async fn test_follower_redirects_to_leader() {
    let (follower, follower_addr) = bind().await;
    let (leader, leader_addr) = bind().await;

    let follower_task = tokio::spawn(async move {
        let mut conn = accept(&follower).await;
        expect_frame(&mut conn, Opcode::SessionConnect).await;
        let redirect = SessionEventBody {
            code: SessionEventCode::Redirect,
            leader_member_id: 1,
            leadership_term_id: 3,
            detail: String::new(),
        };
        conn.send(Frame::session_event(0, &redirect)).await.unwrap();
    });
    let leader_task = tokio::spawn(async move {
        let mut conn = accept(&leader).await;
        expect_frame(&mut conn, Opcode::SessionConnect).await;
        conn.send(Frame::session_event(9, &ok_body(1, 3))).await.unwrap();
        let _ = conn.next().await;
    });

    let endpoints = IngressEndpoints::new([(0, follower_addr), (1, leader_addr)]).unwrap();
    let mut transport = TcpTransport::spawn(
        endpoints,
        fast_config(),
        Box::new(RecordingListener::new()),
    )
    .unwrap();

    poll_until(&mut transport, |t| t.is_connected()).await;
    assert_eq!(transport.leader_member_id(), Some(1));
    assert_eq!(transport.cluster_session_id(), Some(9));

    follower_task.await.unwrap();
    drop(transport);
    leader_task.await.unwrap();
}

#[tokio::test]
async fn test_new_leader_moves_session() {
    let (old_leader, old_addr) = bind().await;
    let (new_leader, new_addr) = bind().await;

    let old_task = tokio::spawn(async move {
        let mut conn = accept(&old_leader).await;
        expect_frame(&mut conn, Opcode::SessionConnect).await;
        conn.send(Frame::session_event(21, &ok_body(0, 1))).await.unwrap();
        let announce = NewLeaderBody {
            leadership_term_id: 2,
            leader_member_id: 1,
        };
        conn.send(Frame::new_leader(21, &announce)).await.unwrap();
        let _ = conn.next().await;
    });
    let new_task = tokio::spawn(async move {
        let mut conn = accept(&new_leader).await;
        let connect = expect_frame(&mut conn, Opcode::SessionConnect).await;
        assert_eq!(connect.session_id(), 21);
        conn.send(Frame::session_event(21, &ok_body(1, 2))).await.unwrap();
        let _ = conn.next().await;
    });

    let endpoints = IngressEndpoints::new([(0, old_addr), (1, new_addr)]).unwrap();
    let recorder = RecordingListener::new();
    let mut transport =
        TcpTransport::spawn(endpoints, fast_config(), Box::new(recorder.clone())).unwrap();

    let watcher = recorder.clone();
    poll_until(&mut transport, |t| {
        t.is_connected() && watcher.count(|e| matches!(e, SessionEvent::Connected { .. })) == 2
    })
    .await;
    assert_eq!(transport.leader_member_id(), Some(1));

    let events = recorder.events();
    assert!(events.contains(&SessionEvent::NewLeader {
        session_id: 21,
        leadership_term_id: 2,
        leader_member_id: 1
    }));
    assert!(events.contains(&SessionEvent::Disconnected {
        details: "leader changed".to_string()
    }));

    drop(transport);
    old_task.await.unwrap();
    new_task.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_member_reports_errors() {
    let (listener, addr) = bind().await;
    drop(listener);

    let endpoints = IngressEndpoints::new([(0, addr)]).unwrap();
    let recorder = RecordingListener::new();
    let mut transport =
        TcpTransport::spawn(endpoints, fast_config(), Box::new(recorder.clone())).unwrap();

    let watcher = recorder.clone();
    poll_until(&mut transport, |_| {
        watcher.count(|e| matches!(e, SessionEvent::Error { .. })) >= 2
    })
    .await;
    assert!(!transport.is_connected());
    assert!(!transport.offer(b"lost").is_accepted());
}
