//! End-to-end relay flow over real sockets.
//!
//! Drives the server the way a headset would: connect, subscribe, stream
//! poses, write variables, fire RPCs, then go silent and get reaped.

use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use roomcast_proto::{
    ClientPose, GlobalVarSet, Message, PoseBody, Rpc, Transform, Vec3, wire,
};
use roomcast_server::{Config, Server};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
    time::timeout,
};

const ROOM: &str = "e2e-stage";
const DEVICE: &str = "itest-device";

fn test_config() -> Config {
    Config {
        dealer_port: 0,
        pub_port: 0,
        discovery_port: 0,
        admin_port: 0,
        inactivity_timeout: Duration::from_millis(300),
        broadcast_min_period: Duration::from_millis(50),
        broadcast_max_period: Duration::from_millis(200),
        ..Config::default()
    }
}

async fn write_unit(stream: &mut TcpStream, frames: &[&[u8]]) {
    let mut buf = BytesMut::new();
    wire::encode_unit(frames, &mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();
}

async fn read_unit<R: AsyncRead + Unpin>(stream: &mut R) -> Option<Vec<Bytes>> {
    let mut count = [0u8; 1];
    stream.read_exact(&mut count).await.ok()?;
    let mut frames = Vec::with_capacity(count[0] as usize);
    for _ in 0..count[0] {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.ok()?;
        let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
        stream.read_exact(&mut body).await.ok()?;
        frames.push(Bytes::from(body));
    }
    Some(frames)
}

/// Read published units until `accept` returns a value, with a deadline.
async fn read_until<T, F>(stream: &mut TcpStream, mut accept: F) -> T
where
    F: FnMut(&[u8], Message) -> Option<T>,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let frames = read_unit(stream).await.expect("publish stream closed");
            assert_eq!(frames.len(), 2, "published units are two frames");
            if let Ok(message) = Message::decode(frames[1].clone())
                && let Some(value) = accept(&frames[1], message)
            {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for a published unit")
}

fn pose_payload(sequence: u32) -> Bytes {
    let pose = PoseBody {
        head: Transform { position: Vec3::new(1.0, 2.0, 3.0), rotation: [0.0, 0.0, 0.0, 1.0] },
        ..PoseBody::identity()
    };
    let upload = ClientPose::new(DEVICE, sequence, &pose).unwrap();
    Message::ClientPose(upload).to_bytes().unwrap()
}

#[tokio::test]
async fn poses_rpcs_vars_and_reaping_flow_end_to_end() {
    let server = Server::bind(test_config()).await.unwrap();
    let dealer_port = server.dealer_addr().unwrap().port();
    let pub_port = server.pub_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.run(shutdown_rx));

    // Subscribe to the room topic.
    let mut sub = TcpStream::connect(("127.0.0.1", pub_port)).await.unwrap();
    let subscribe = [&[0x01][..], ROOM.as_bytes()].concat();
    write_unit(&mut sub, &[&subscribe[..]]).await;

    // Stream poses at a steady clip so broadcasts keep flowing even if the
    // subscription registers a beat late.
    let pump = tokio::spawn(async move {
        let mut client = TcpStream::connect(("127.0.0.1", dealer_port)).await.unwrap();
        let mut sequence = 1u32;
        loop {
            let payload = pose_payload(sequence);
            write_unit(&mut client, &[ROOM.as_bytes(), &payload]).await;
            sequence += 1;
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    });

    // The room broadcast carries our client at number 1 with the quantized
    // pose.
    let (client_no, pose) = read_until(&mut sub, |_, message| match message {
        Message::RoomPose { room_id, mut clients } if room_id == ROOM && !clients.is_empty() => {
            Some(clients.remove(0))
        },
        _ => None,
    })
    .await;
    assert_eq!(client_no, 1);
    assert!((pose.head.position.x - 1.0).abs() < 0.01);
    assert!((pose.head.position.z - 3.0).abs() < 0.01);

    // The mapping resolves number 1 back to the device id.
    let entry = read_until(&mut sub, |_, message| match message {
        Message::DeviceIdMapping(entries) => {
            entries.into_iter().find(|entry| entry.client_no == 1)
        },
        _ => None,
    })
    .await;
    assert_eq!(entry.device_id, DEVICE);
    assert!(!entry.stealth);

    // A variable write fans out on the next tick.
    let mut writer = TcpStream::connect(("127.0.0.1", dealer_port)).await.unwrap();
    let set = Message::GlobalVarSet(GlobalVarSet {
        sender: 1,
        name: "scene".into(),
        value: "lobby".into(),
        timestamp: 1_700_000_000.0,
    })
    .to_bytes()
    .unwrap();
    write_unit(&mut writer, &[ROOM.as_bytes(), &set]).await;

    let entry = read_until(&mut sub, |_, message| match message {
        Message::GlobalVarSync(entries) => {
            entries.into_iter().find(|entry| entry.name == "scene")
        },
        _ => None,
    })
    .await;
    assert_eq!(entry.value, "lobby");
    assert_eq!(entry.writer, 1);

    // A broadcast RPC is re-published byte for byte.
    let rpc = Message::RpcBroadcast(Rpc {
        sender: 1,
        function: "SpawnAnchor".into(),
        args: r#"{"x":1.5}"#.into(),
    })
    .to_bytes()
    .unwrap();
    write_unit(&mut writer, &[ROOM.as_bytes(), &rpc]).await;

    let relayed = read_until(&mut sub, |raw, message| match message {
        Message::RpcBroadcast(_) => Some(Bytes::copy_from_slice(raw)),
        _ => None,
    })
    .await;
    assert_eq!(relayed, rpc);

    // Silence: the client is reaped, the next broadcast is empty, and the
    // mapping no longer lists it.
    pump.abort();
    read_until(&mut sub, |_, message| match message {
        Message::RoomPose { room_id, clients } if room_id == ROOM && clients.is_empty() => {
            Some(())
        },
        _ => None,
    })
    .await;

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn admin_preseed_and_stats_over_http() {
    let server = Server::bind(test_config()).await.unwrap();
    let admin_addr = server.admin_addr().unwrap();
    let rooms = server.rooms();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.run(shutdown_rx));

    let body = r#"{"team":"blue"}"#;
    let request = format!(
        "POST /v1/rooms/admin-room/devices/dev-admin/client-variables HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    );

    let mut http = TcpStream::connect(("127.0.0.1", admin_addr.port())).await.unwrap();
    http.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(5), http.read_to_string(&mut response)).await.unwrap().unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");

    // The seed is waiting for the device and lands when it binds.
    let slot = rooms.get("admin-room").await.unwrap();
    {
        let mut room = slot.write().await;
        let (client_no, _) = room.upsert_client("dev-admin", std::time::Instant::now()).unwrap();
        let entry = room.client_vars(client_no).unwrap().get("team").unwrap();
        assert_eq!(entry.value, "blue");
        assert_eq!(entry.writer, 0);
    }

    // Stats are served as JSON.
    let mut http = TcpStream::connect(("127.0.0.1", admin_addr.port())).await.unwrap();
    http.write_all(
        b"GET /v1/stats HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await
    .unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(5), http.read_to_string(&mut response)).await.unwrap().unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    assert!(response.contains("relayed_poses"));

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn stealth_clients_stay_listed_but_invisible() {
    let server = Server::bind(test_config()).await.unwrap();
    let dealer_port = server.dealer_addr().unwrap().port();
    let pub_port = server.pub_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.run(shutdown_rx));

    let mut sub = TcpStream::connect(("127.0.0.1", pub_port)).await.unwrap();
    let subscribe = [&[0x01][..], b"ghost-room".as_slice()].concat();
    write_unit(&mut sub, &[&subscribe[..]]).await;

    let pump = tokio::spawn(async move {
        let mut client = TcpStream::connect(("127.0.0.1", dealer_port)).await.unwrap();
        let mut sequence = 1u32;
        loop {
            let upload = ClientPose::new("ghost-dev", sequence, &PoseBody::invisible()).unwrap();
            let payload = Message::ClientPose(upload).to_bytes().unwrap();
            write_unit(&mut client, &[b"ghost-room", &payload]).await;
            sequence += 1;
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    });

    // The broadcast keeps the client present and flags it stealth; the
    // sentinel coordinates come through as NaN.
    let pose = read_until(&mut sub, |_, message| match message {
        Message::RoomPose { room_id, mut clients }
            if room_id == "ghost-room" && !clients.is_empty() =>
        {
            Some(clients.remove(0).1)
        },
        _ => None,
    })
    .await;
    assert!(pose.stealth);
    assert!(pose.head.position.x.is_nan());

    let entry = read_until(&mut sub, |_, message| match message {
        Message::DeviceIdMapping(entries) => entries.into_iter().next(),
        _ => None,
    })
    .await;
    assert_eq!(entry.device_id, "ghost-dev");
    assert!(entry.stealth);

    pump.abort();
    let _ = shutdown_tx.send(true);
}
