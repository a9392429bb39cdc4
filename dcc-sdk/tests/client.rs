//! Client loop tests against a scripted IRC server.
//!
//! Tests cover:
//! - Registration and CTCP DCC offers surfacing as events
//! - Server lines split across TCP segments
//! - DCC commands turning into CTCP offers on the wire

use std::time::Duration;

use dcc_sdk::client::{self, ClientHandle, ConnectConfig};
use dcc_sdk::dcc::{ConnectionKind, DccEvent};
use dcc_sdk::event::Event;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

async fn next_event(rx: &mut mpsc::Receiver<Event>, want: impl Fn(&Event) -> bool) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

struct Session {
    handle: ClientHandle,
    events: mpsc::Receiver<Event>,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// Connect a client as "me" to a scripted server and complete registration.
async fn registered() -> Session {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let config = ConnectConfig {
        server_addr: addr.to_string(),
        nick: "me".to_string(),
        ..ConnectConfig::default()
    };
    let tcp = client::establish_connection(&config).await.unwrap();
    let (handle, mut events) = client::connect_with_stream(tcp, config);

    let (conn, _) = server.accept().await.unwrap();
    let (reader, mut writer) = conn.into_split();
    let mut lines = BufReader::new(reader).lines();

    assert_eq!(lines.next_line().await.unwrap().unwrap(), "NICK me");
    assert!(lines.next_line().await.unwrap().unwrap().starts_with("USER user 0 * :"));

    writer.write_all(b":irc.test 001 me :Welcome\r\n").await.unwrap();
    next_event(&mut events, |e| matches!(e, Event::Registered { nick } if nick == "me")).await;

    Session {
        handle,
        events,
        lines,
        writer,
    }
}

#[tokio::test]
async fn offers_become_events_and_commands_become_offers() {
    let Session {
        handle,
        mut events,
        mut lines,
        mut writer,
    } = registered().await;

    writer
        .write_all(b":bob!b@host PRIVMSG me :\x01DCC CHAT chat 2130706433 5000\x01\r\n")
        .await
        .unwrap();
    let event = next_event(&mut events, |e| matches!(e, Event::Dcc(DccEvent::Request { .. }))).await;
    let Event::Dcc(DccEvent::Request { user, kind, address, .. }) = event else {
        unreachable!()
    };
    assert_eq!((user.as_str(), kind), ("bob", ConnectionKind::Chat));
    assert_eq!(address.to_string(), "127.0.0.1:5000");
    next_event(&mut events, |e| {
        matches!(e, Event::DccNotice { text } if text.starts_with("DCC CHAT (chat) request received from bob!b@host"))
    })
    .await;

    handle.dcc("CHAT carol").await.unwrap();
    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(
        line.starts_with("PRIVMSG carol :\x01DCC CHAT chat 2130706433 "),
        "unexpected line: {line:?}"
    );
    assert!(line.ends_with('\x01'));

    let ctl = handle.dcc_ctl("USERMATCH carol").await.unwrap();
    assert!(ctl.is_some_and(|refs| !refs.is_empty()));

    handle.quit(Some("bye")).await.unwrap();
}

#[tokio::test]
async fn offer_split_across_segments_is_reassembled() {
    let Session {
        handle,
        mut events,
        lines: _lines,
        mut writer,
    } = registered().await;

    writer.write_all(b":bob!b@host PRIVMSG me :\x01DCC CH").await.unwrap();
    writer.flush().await.unwrap();
    // Long enough for the supervisor tick to win the select meanwhile.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    writer
        .write_all(b"AT chat 2130706433 5000\x01\r\n")
        .await
        .unwrap();

    let event = next_event(&mut events, |e| {
        matches!(e, Event::Dcc(DccEvent::Request { .. }) | Event::RawLine(_))
    })
    .await;
    let Event::RawLine(raw) = event else {
        panic!("offer surfaced before its raw line: {event:?}")
    };
    assert_eq!(raw, ":bob!b@host PRIVMSG me :\x01DCC CHAT chat 2130706433 5000\x01");
    let event = next_event(&mut events, |e| matches!(e, Event::Dcc(DccEvent::Request { .. }))).await;
    assert!(matches!(event, Event::Dcc(DccEvent::Request { kind: ConnectionKind::Chat, .. })));

    handle.quit(None).await.unwrap();
}
