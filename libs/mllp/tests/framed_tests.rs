use bytes::Bytes;
use conduit_mllp::{Frame, MllpCodec, CARRIAGE_RETURN, END_BLOCK, START_BLOCK};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{Framed, FramedRead};

#[tokio::test]
async fn frames_survive_byte_at_a_time_delivery() {
    let (mut client, server) = tokio::io::duplex(64);
    let mut reader = FramedRead::new(server, MllpCodec::new());

    let mut wire = vec![START_BLOCK];
    wire.extend_from_slice(b"MSH|^~\\&|A|B|C|D|20240101||ADT^A01|1|P|2.5\r");
    wire.extend_from_slice(&[END_BLOCK, CARRIAGE_RETURN]);

    tokio::spawn(async move {
        for byte in wire {
            client.write_all(&[byte]).await.unwrap();
        }
    });

    match reader.next().await {
        Some(Ok(Frame::Message(payload))) => assert!(payload.starts_with(b"MSH|")),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn framed_transport_carries_messages_both_ways() {
    let (left, right) = tokio::io::duplex(1024);
    let mut sender = Framed::new(left, MllpCodec::new());
    let mut receiver = Framed::new(right, MllpCodec::new());

    sender.send(Bytes::from_static(b"first")).await.unwrap();
    sender.send(Bytes::from_static(b"")).await.unwrap();
    sender.send(Bytes::from_static(b"second")).await.unwrap();

    assert_eq!(
        receiver.next().await.unwrap().unwrap(),
        Frame::Message(Bytes::from_static(b"first"))
    );
    assert_eq!(receiver.next().await.unwrap().unwrap(), Frame::KeepAlive);
    assert_eq!(
        receiver.next().await.unwrap().unwrap(),
        Frame::Message(Bytes::from_static(b"second"))
    );

    receiver.send("ACK").await.unwrap();
    assert_eq!(
        sender.next().await.unwrap().unwrap(),
        Frame::Message(Bytes::from_static(b"ACK"))
    );
}

#[tokio::test]
async fn truncated_connection_reports_incomplete_frame() {
    let (mut client, server) = tokio::io::duplex(64);
    let mut reader = FramedRead::new(server, MllpCodec::new());

    client.write_all(&[START_BLOCK, b'M', b'S', b'H']).await.unwrap();
    drop(client);

    assert!(reader.next().await.unwrap().is_err());
}
