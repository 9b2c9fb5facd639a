use super::*;
use crate::config::SwarmConfig;
use crate::stats::Statistics;
use crate::storage::{sha1_digest, ResumeCheck, StoreGroup, TorrentLayout};
use crate::swarm::PoolMember;
use crate::task::TorrentContext;
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub(super) const PIECE: u64 = 16384;
const INFO_HASH: [u8; 20] = [9u8; 20];

pub(super) fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8 + 1).collect()
}

pub(super) fn layout_for(files: &[(&str, u64)], data: &[u8]) -> Arc<TorrentLayout> {
    let hashes = data.chunks(PIECE as usize).map(sha1_digest).collect();
    let files = files.iter().map(|(p, l)| (PathBuf::from(p), *l)).collect();
    Arc::new(TorrentLayout::from_files(INFO_HASH, PIECE, files, hashes).unwrap())
}

fn peer_addr() -> SocketAddr {
    "127.0.0.1:6881".parse().unwrap()
}

pub(super) async fn context(dir: &Path, layout: Arc<TorrentLayout>, config: SwarmConfig) -> TorrentContext {
    let group = StoreGroup::open(layout, dir, None, config.store_options())
        .await
        .unwrap();
    TorrentContext::new(
        Arc::new(group),
        Arc::new(config),
        Arc::new(Statistics::new()),
        PeerId::generate(),
        16,
    )
}

/// Writes `disk` as the files' contents, then opens with a verifying resume.
async fn resumed_context(
    dir: &Path,
    layout: Arc<TorrentLayout>,
    disk: &[u8],
    config: SwarmConfig,
) -> TorrentContext {
    for entry in layout.files() {
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        std::fs::write(dir.join(&entry.path), &disk[start..end]).unwrap();
    }
    context(dir, layout, config.with_resume_check(ResumeCheck::Verify)).await
}

pub(super) fn session_for(ctx: &TorrentContext) -> Arc<PeerSession> {
    Arc::new(PeerSession::new(
        peer_addr(),
        ctx.piece_count(),
        ctx.statistics.clone(),
    ))
}

pub(super) fn remote_handshake(capabilities: Capabilities) -> Handshake {
    Handshake::new(INFO_HASH, PeerId::generate()).with_capabilities(capabilities)
}

fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

pub(super) async fn next_message(rx: &mut UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message in time")
        .expect("channel closed")
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// Codec

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1, id2);
    assert!(id1.is_ours());
    assert_eq!(id1.client_id(), Some("SW0001"));
}

#[test]
fn test_bitfield_wire_order() {
    let bf = Bitfield::from_bytes(&[0x80, 0x01], 16);
    assert!(bf.has(0));
    assert!(!bf.has(1));
    assert!(bf.has(15));
    assert_eq!(bf.count(), 2);

    // spare bits past the piece count are ignored
    let bf = Bitfield::from_bytes(&[0xFF], 3);
    assert_eq!(bf.count(), 3);
    assert!(bf.is_complete());
}

#[test]
fn test_capabilities_reserved_bits() {
    let caps = Capabilities::all();
    let reserved = caps.to_reserved();
    assert_eq!(reserved[5], 0x10);
    assert_eq!(reserved[7], 0x05);
    assert_eq!(Capabilities::from_reserved(&reserved), caps);

    let only_dht = Capabilities::from_reserved(&[0, 0, 0, 0, 0, 0, 0, 0x01]);
    assert!(only_dht.contains(Capability::Dht));
    assert!(!only_dht.contains(Capability::Fast));
    assert!(!only_dht.contains(Capability::Extension));
}

#[test]
fn test_handshake_encode_decode() {
    let peer_id = PeerId::generate();
    let handshake = Handshake::new(INFO_HASH, peer_id)
        .with_capabilities(Capabilities::empty().with(Capability::Fast));
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), 68);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded, handshake);
    assert!(decoded.capabilities.contains(Capability::Fast));
    assert!(!decoded.capabilities.contains(Capability::Dht));
}

#[test]
fn test_handshake_rejects_other_protocol() {
    let mut encoded = Handshake::new(INFO_HASH, PeerId::generate()).encode().to_vec();
    encoded[1] = b'X';
    assert!(matches!(
        Handshake::decode(&encoded),
        Err(PeerError::InvalidHandshake)
    ));
}

#[test]
fn test_message_encode_decode() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xA0])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 1,
            begin: 0,
            data: Bytes::from_static(b"slice"),
        },
        Message::Cancel {
            index: 1,
            begin: 0,
            length: 16384,
        },
        Message::Port(6881),
        Message::Suggest { piece: 3 },
        Message::HaveAll,
        Message::HaveNone,
        Message::Reject {
            index: 2,
            begin: 0,
            length: 16384,
        },
        Message::AllowedFast { piece: 5 },
        Message::Extended {
            id: 0,
            payload: Bytes::from_static(b"d1:v3:abce"),
        },
    ];

    for message in messages {
        let decoded = Message::decode(message.encode()).unwrap();
        assert_eq!(decoded, message);
    }
}

#[test]
fn test_message_decode_errors() {
    // have with a two-byte payload
    let short = Bytes::from_static(&[0, 0, 0, 3, 4, 0, 1]);
    assert!(matches!(
        Message::decode(short),
        Err(PeerError::InvalidMessage(_))
    ));

    let unknown = Bytes::from_static(&[0, 0, 0, 1, 99]);
    assert!(matches!(
        Message::decode(unknown),
        Err(PeerError::InvalidMessageId(99))
    ));

    let truncated = Bytes::from_static(&[0, 0, 0, 5, 4, 0]);
    assert!(Message::decode(truncated).is_err());
}

#[test]
fn test_choking_state_default() {
    let state = ChokingState::default();
    assert!(state.am_choking);
    assert!(!state.am_interested);
    assert!(state.peer_choking);
    assert!(!state.peer_interested);
    assert!(!state.can_download());
    assert!(!state.can_upload());
}

// Transport

#[tokio::test]
async fn test_transport_frames_over_duplex() {
    let (a, b) = tokio::io::duplex(1024);
    let mut left = PeerTransport::new(a);
    let mut right = PeerTransport::new(b);

    let handshake = Handshake::new(INFO_HASH, PeerId::generate());
    left.send_handshake(&handshake).await.unwrap();
    left.send_message(&Message::Interested).await.unwrap();
    left.send_message(&Message::Have { piece: 7 }).await.unwrap();

    assert_eq!(right.receive_handshake().await.unwrap(), handshake);

    // bytes already buffered survive the split
    let (mut reader, _writer) = right.into_split();
    assert_eq!(reader.receive_message().await.unwrap(), Message::Interested);
    assert_eq!(
        reader.receive_message().await.unwrap(),
        Message::Have { piece: 7 }
    );

    drop(left);
    assert!(matches!(
        reader.receive_message().await,
        Err(PeerError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_handshake_rejects_info_hash_mismatch() {
    let (a, b) = tokio::io::duplex(1024);
    let mut launcher = PeerTransport::new(a);
    let mut uploader = PeerTransport::new(b);

    let sent = tokio::spawn(async move {
        launcher
            .send_handshake(&Handshake::new([1u8; 20], PeerId::generate()))
            .await
    });

    let result = handshake(&mut uploader, INFO_HASH, PeerId::generate(), ConnectionRole::Uploader).await;
    assert!(matches!(result, Err(PeerError::InfoHashMismatch)));
    sent.await.unwrap().unwrap();
}

// Connection

#[tokio::test]
async fn test_established_advertises_pieces_with_default_flags() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(4 * PIECE as usize);
    let layout = layout_for(&[("a.bin", data.len() as u64)], &data);
    let ctx = resumed_context(temp.path(), layout, &data, SwarmConfig::default()).await;
    let session = session_for(&ctx);

    let (conn, mut rx) = PeerConnection::new(ctx.clone(), session.clone(), ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::empty()));

    assert_eq!(conn.state(), ConnectionState::Established);
    assert_eq!(session.flags(), ChokingState::default());
    assert_eq!(
        drain(&mut rx),
        vec![Message::Bitfield(Bitfield::full(4).to_bytes())]
    );

    // with the fast extension a complete store announces have_all
    let (conn, mut rx) = PeerConnection::new(ctx, session, ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::all()));
    assert_eq!(drain(&mut rx), vec![Message::HaveAll]);
}

#[tokio::test]
async fn test_interest_follows_remote_availability() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(4 * PIECE as usize);
    let layout = layout_for(&[("a.bin", data.len() as u64)], &data);
    let mut disk = data.clone();
    disk[3 * PIECE as usize..].fill(0);
    let ctx = resumed_context(temp.path(), layout, &disk, SwarmConfig::default()).await;
    assert_eq!(ctx.group.pieces(), Bitfield::from_indices(4, [0, 1, 2]));

    let session = session_for(&ctx);
    let (conn, mut rx) = PeerConnection::new(ctx, session.clone(), ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::empty()));
    drain(&mut rx);

    let remote = Bitfield::from_indices(4, [0, 1]);
    conn.handle_message(Message::Bitfield(remote.to_bytes()))
        .await
        .unwrap();
    assert_eq!(drain(&mut rx), vec![Message::NotInterested]);
    assert!(!session.flags().am_interested);

    let remote = Bitfield::from_indices(4, [0, 1, 3]);
    conn.handle_message(Message::Bitfield(remote.to_bytes()))
        .await
        .unwrap();
    assert_eq!(drain(&mut rx), vec![Message::Interested]);
    assert!(session.flags().am_interested);

    // a have that changes nothing is not answered
    conn.handle_message(Message::Have { piece: 2 }).await.unwrap();
    assert!(drain(&mut rx).is_empty());
    // still choked, so no download starts
    assert!(!conn.is_downloading());
}

#[tokio::test]
async fn test_invalid_messages_close_connection() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(2 * PIECE as usize);
    let layout = layout_for(&[("a.bin", data.len() as u64)], &data);
    let ctx = context(temp.path(), layout, SwarmConfig::default()).await;
    let (conn, _rx) = PeerConnection::new(ctx.clone(), session_for(&ctx), ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::empty()));

    assert!(matches!(
        conn.handle_message(Message::Have { piece: 2 }).await,
        Err(PeerError::Protocol(_))
    ));
    assert!(matches!(
        conn.handle_message(Message::Bitfield(Bytes::from_static(&[0xC0, 0x00])))
            .await,
        Err(PeerError::InvalidMessage(_))
    ));
    assert!(matches!(
        conn.handle_message(Message::Request {
            index: 0,
            begin: 0,
            length: 1 << 20,
        })
        .await,
        Err(PeerError::Protocol(_))
    ));
}

#[tokio::test]
async fn test_request_while_choking_is_rejected() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(2 * PIECE as usize);
    let layout = layout_for(&[("a.bin", data.len() as u64)], &data);
    let ctx = resumed_context(temp.path(), layout, &data, SwarmConfig::default()).await;
    let (conn, mut rx) = PeerConnection::new(ctx.clone(), session_for(&ctx), ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::all()));
    drain(&mut rx);

    let request = Message::Request {
        index: 0,
        begin: 0,
        length: 16384,
    };
    conn.handle_message(request.clone()).await.unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![Message::Reject {
            index: 0,
            begin: 0,
            length: 16384,
        }]
    );

    // interest from the remote unchokes it, then the request is served
    conn.handle_message(Message::Interested).await.unwrap();
    assert_eq!(drain(&mut rx), vec![Message::Unchoke]);
    conn.handle_message(request).await.unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![Message::Piece {
            index: 0,
            begin: 0,
            data: Bytes::copy_from_slice(&data[..16384]),
        }]
    );
    assert_eq!(conn.upload_mark(), 16384);
    assert_eq!(conn.upload_mark(), 0);
    assert_eq!(ctx.statistics.uploaded(), 16384);
}

#[tokio::test]
async fn test_allowed_fast_piece_served_while_choking() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(2 * PIECE as usize);
    let layout = layout_for(&[("a.bin", data.len() as u64)], &data);
    let ctx = resumed_context(temp.path(), layout, &data, SwarmConfig::default()).await;
    let (conn, mut rx) = PeerConnection::new(ctx.clone(), session_for(&ctx), ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::all()));
    drain(&mut rx);

    assert!(conn.allow_fast(1));
    assert!(!conn.allow_fast(2));
    assert_eq!(drain(&mut rx), vec![Message::AllowedFast { piece: 1 }]);

    conn.handle_message(Message::Request {
        index: 1,
        begin: 0,
        length: 100,
    })
    .await
    .unwrap();
    let start = PIECE as usize;
    assert_eq!(
        drain(&mut rx),
        vec![Message::Piece {
            index: 1,
            begin: 0,
            data: Bytes::copy_from_slice(&data[start..start + 100]),
        }]
    );
    assert!(conn.session().flags().am_choking);
}

#[tokio::test]
async fn test_download_pipelines_slice_requests() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE as usize);
    let layout = layout_for(&[("a.bin", PIECE)], &data);
    let config = SwarmConfig::default().with_slice_length(4096);
    let ctx = context(temp.path(), layout, config).await;
    let session = session_for(&ctx);
    let (conn, mut rx) = PeerConnection::new(ctx.clone(), session.clone(), ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::empty()));

    let started = Instant::now();
    conn.handle_message(Message::Bitfield(Bitfield::full(1).to_bytes()))
        .await
        .unwrap();
    assert_eq!(next_message(&mut rx).await, Message::Interested);
    conn.handle_message(Message::Unchoke).await.unwrap();

    // both window slots are requested before any response
    let mut pending = Vec::new();
    for _ in 0..2 {
        pending.push(next_message(&mut rx).await);
    }
    assert_eq!(
        pending,
        vec![
            Message::Request {
                index: 0,
                begin: 0,
                length: 4096,
            },
            Message::Request {
                index: 0,
                begin: 4096,
                length: 4096,
            },
        ]
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(conn.outstanding(), 2);

    let mut answered = 0;
    while answered < 4 {
        if let Message::Request { index, begin, length } = pending.remove(0) {
            let range = begin as usize..(begin + length) as usize;
            conn.handle_message(Message::Piece {
                index,
                begin,
                data: Bytes::copy_from_slice(&data[range]),
            })
            .await
            .unwrap();
            answered += 1;
        }
        if answered < 3 {
            pending.push(next_message(&mut rx).await);
        }
    }

    wait_for(|| ctx.group.is_complete()).await;
    assert_eq!(next_message(&mut rx).await, Message::NotInterested);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.statistics().downloaded(), PIECE);
    assert_eq!(conn.download_mark(), PIECE);
    assert_eq!(conn.download_mark(), 0);
}

#[tokio::test]
async fn test_corrupt_piece_is_not_stored() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE as usize);
    let layout = layout_for(&[("a.bin", PIECE)], &data);
    let ctx = context(temp.path(), layout, SwarmConfig::default()).await;
    let session = session_for(&ctx);
    let (conn, mut rx) = PeerConnection::new(ctx.clone(), session.clone(), ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::empty()));

    conn.handle_message(Message::Bitfield(Bitfield::full(1).to_bytes()))
        .await
        .unwrap();
    conn.handle_message(Message::Unchoke).await.unwrap();
    assert_eq!(next_message(&mut rx).await, Message::Interested);
    assert_eq!(
        next_message(&mut rx).await,
        Message::Request {
            index: 0,
            begin: 0,
            length: 16384,
        }
    );

    conn.handle_message(Message::Piece {
        index: 0,
        begin: 0,
        data: Bytes::from(vec![0u8; PIECE as usize]),
    })
    .await
    .unwrap();

    // the piece is never requested from this peer again
    assert_eq!(next_message(&mut rx).await, Message::NotInterested);
    wait_for(|| !conn.is_downloading()).await;
    assert!(!ctx.group.have_piece(0));
    assert!(session.available_pieces().is_empty());
    assert_eq!(session.statistics().downloaded(), 0);
}

#[tokio::test]
async fn test_stale_slice_is_discarded() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE as usize);
    let layout = layout_for(&[("a.bin", PIECE)], &data);
    let ctx = context(temp.path(), layout, SwarmConfig::default()).await;
    let (conn, _rx) = PeerConnection::new(ctx.clone(), session_for(&ctx), ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::empty()));

    conn.handle_message(Message::Piece {
        index: 0,
        begin: 0,
        data: Bytes::from_static(b"unrequested"),
    })
    .await
    .unwrap();
    assert_eq!(conn.outstanding(), 0);
    assert_eq!(conn.download_mark(), 0);
    assert!(!ctx.group.have_piece(0));
}

#[tokio::test]
async fn test_release_chokes_and_closes() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE as usize);
    let layout = layout_for(&[("a.bin", PIECE)], &data);
    let ctx = resumed_context(temp.path(), layout, &data, SwarmConfig::default()).await;
    let session = session_for(&ctx);
    assert!(session.claim());

    let (conn, mut rx) = PeerConnection::new(ctx, session.clone(), ConnectionRole::Uploader);
    conn.establish(&remote_handshake(Capabilities::empty()));
    assert!(session.is_uploading());
    assert_eq!(
        drain(&mut rx),
        vec![
            Message::Bitfield(Bitfield::full(1).to_bytes()),
            Message::Unchoke,
        ]
    );

    conn.clone().release().await;
    assert_eq!(drain(&mut rx), vec![Message::Choke]);
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(!conn.is_available());
    assert!(!session.is_connected());
    assert!(!session.is_uploading());
    assert!(!conn.send(Message::KeepAlive));
}

#[tokio::test]
async fn test_marks() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE as usize);
    let layout = layout_for(&[("a.bin", PIECE)], &data);
    let ctx = context(temp.path(), layout, SwarmConfig::default()).await;
    let (conn, _rx) = PeerConnection::new(ctx.clone(), session_for(&ctx), ConnectionRole::Uploader);

    assert!(!PoolMember::marked(conn.as_ref()));
    assert!(PoolMember::marked(conn.as_ref()));
    assert_eq!(PoolMember::upload_mark(conn.as_ref()), 0);
    conn.session().statistics().record_upload(500);
    assert_eq!(PoolMember::upload_mark(conn.as_ref()), 500);
    assert_eq!(PoolMember::upload_mark(conn.as_ref()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_seeder_to_leecher_over_duplex() {
    let seed_dir = TempDir::new().unwrap();
    let leech_dir = TempDir::new().unwrap();
    let data = sample_data(40000);
    let layout = layout_for(&[("a.bin", 20000), ("b.bin", 20000)], &data);

    let seeder = resumed_context(seed_dir.path(), layout.clone(), &data, SwarmConfig::default()).await;
    let leecher = context(leech_dir.path(), layout, SwarmConfig::default()).await;
    assert!(seeder.group.is_complete());

    let (a, b) = tokio::io::duplex(64 * 1024);
    let mut launcher_side = PeerTransport::new(a);
    let mut uploader_side = PeerTransport::new(b);

    let seeder_id = seeder.peer_id;
    let uploaded = tokio::spawn(async move {
        let remote = handshake(&mut uploader_side, INFO_HASH, seeder_id, ConnectionRole::Uploader)
            .await
            .unwrap();
        (uploader_side, remote)
    });
    let remote = handshake(
        &mut launcher_side,
        INFO_HASH,
        leecher.peer_id,
        ConnectionRole::Launcher,
    )
    .await
    .unwrap();
    let (uploader_side, seeder_remote) = uploaded.await.unwrap();
    assert_eq!(remote.peer_id, seeder.peer_id);
    assert_eq!(seeder_remote.peer_id, leecher.peer_id);

    let seeder_session = session_for(&seeder);
    let (seeder_conn, seeder_rx) =
        PeerConnection::new(seeder.clone(), seeder_session, ConnectionRole::Uploader);
    seeder_conn.start(uploader_side, seeder_remote, seeder_rx);

    let leecher_session = session_for(&leecher);
    let (leecher_conn, leecher_rx) =
        PeerConnection::new(leecher.clone(), leecher_session.clone(), ConnectionRole::Launcher);
    leecher_conn.start(launcher_side, remote, leecher_rx);

    wait_for(|| leecher.group.is_complete()).await;
    assert!(leecher_session.supports(Capability::Fast));
    assert_eq!(leecher_session.client_name().as_deref(), Some("SW0001"));

    leecher_conn.clone().release().await;
    leecher.group.release().await.unwrap();
    assert_eq!(leecher.statistics.downloaded(), 40000);
    assert_eq!(seeder.statistics.uploaded(), 40000);

    let mut received = std::fs::read(leech_dir.path().join("a.bin")).unwrap();
    received.extend(std::fs::read(leech_dir.path().join("b.bin")).unwrap());
    assert_eq!(received, data);

    // the seeder sees the close
    wait_for(|| !seeder_conn.is_available()).await;
}

#[tokio::test]
async fn test_piece_wait_timeout_returns_piece() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE as usize);
    let layout = layout_for(&[("a.bin", PIECE)], &data);
    let config = SwarmConfig::default().with_piece_wait(Duration::from_millis(200));
    let ctx = context(temp.path(), layout, config).await;
    let (conn, mut rx) = PeerConnection::new(ctx.clone(), session_for(&ctx), ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::empty()));

    conn.handle_message(Message::Bitfield(Bitfield::full(1).to_bytes()))
        .await
        .unwrap();
    let started = Instant::now();
    conn.handle_message(Message::Unchoke).await.unwrap();
    assert_eq!(next_message(&mut rx).await, Message::Interested);
    assert_eq!(
        next_message(&mut rx).await,
        Message::Request {
            index: 0,
            begin: 0,
            length: 16384,
        }
    );

    // the stalled piece is skipped by the next pick
    assert_eq!(next_message(&mut rx).await, Message::NotInterested);
    assert!(started.elapsed() >= Duration::from_millis(200));
    wait_for(|| !conn.is_downloading()).await;
    let store = &ctx.group.stores()[0];
    assert!(!store.downloading_pieces().has(0));
    assert!(!ctx.group.have_piece(0));

    // a late answer no longer counts
    conn.handle_message(Message::Piece {
        index: 0,
        begin: 0,
        data: Bytes::copy_from_slice(&data),
    })
    .await
    .unwrap();
    assert_eq!(conn.download_mark(), 0);
    assert!(!ctx.group.have_piece(0));
}

#[tokio::test]
async fn test_unanswered_slice_window_abandons_piece() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE as usize);
    let layout = layout_for(&[("a.bin", PIECE)], &data);
    let config = SwarmConfig::default()
        .with_slice_length(4096)
        .with_slice_request_size(2)
        .with_max_wait_slice_requests(2)
        .with_slice_wait(Duration::from_millis(100))
        .with_piece_wait(Duration::from_millis(100));
    let ctx = context(temp.path(), layout, config).await;
    let (conn, mut rx) = PeerConnection::new(ctx.clone(), session_for(&ctx), ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::empty()));

    conn.handle_message(Message::Bitfield(Bitfield::full(1).to_bytes()))
        .await
        .unwrap();
    conn.handle_message(Message::Unchoke).await.unwrap();
    assert_eq!(next_message(&mut rx).await, Message::Interested);

    let mut sent = Vec::new();
    loop {
        let message = next_message(&mut rx).await;
        if message == Message::NotInterested {
            break;
        }
        sent.push(message);
    }

    // the window filled and never drained, so no third slice was requested
    assert_eq!(
        sent,
        vec![
            Message::Request {
                index: 0,
                begin: 0,
                length: 4096,
            },
            Message::Request {
                index: 0,
                begin: 4096,
                length: 4096,
            },
        ]
    );
    wait_for(|| !conn.is_downloading()).await;
    assert!(!ctx.group.stores()[0].downloading_pieces().has(0));
    assert!(!ctx.group.have_piece(0));
}

/// Starts a download of a two-slice piece and answers the first slice.
async fn half_downloaded(
    dir: &Path,
    data: &[u8],
    config: SwarmConfig,
) -> (TorrentContext, Arc<PeerConnection>, UnboundedReceiver<Message>) {
    let layout = layout_for(&[("a.bin", PIECE)], data);
    let ctx = context(dir, layout, config.with_slice_length(8192)).await;
    let (conn, mut rx) = PeerConnection::new(ctx.clone(), session_for(&ctx), ConnectionRole::Launcher);
    conn.establish(&remote_handshake(Capabilities::empty()));

    conn.handle_message(Message::Bitfield(Bitfield::full(1).to_bytes()))
        .await
        .unwrap();
    conn.handle_message(Message::Unchoke).await.unwrap();
    assert_eq!(next_message(&mut rx).await, Message::Interested);
    for _ in 0..2 {
        assert!(matches!(next_message(&mut rx).await, Message::Request { .. }));
    }
    conn.handle_message(Message::Piece {
        index: 0,
        begin: 0,
        data: Bytes::copy_from_slice(&data[..8192]),
    })
    .await
    .unwrap();
    assert_eq!(conn.outstanding(), 1);
    (ctx, conn, rx)
}

#[tokio::test]
async fn test_release_waits_for_piece_in_flight() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE as usize);
    let config = SwarmConfig::default().with_release_wait(Duration::from_secs(2));
    let (ctx, conn, mut rx) = half_downloaded(temp.path(), &data, config).await;

    let releasing = tokio::spawn(conn.clone().release());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!conn.is_available());
    assert!(!releasing.is_finished());

    conn.handle_message(Message::Piece {
        index: 0,
        begin: 8192,
        data: Bytes::copy_from_slice(&data[8192..]),
    })
    .await
    .unwrap();
    releasing.await.unwrap();

    assert!(ctx.group.have_piece(0));
    assert_eq!(conn.session().statistics().downloaded(), PIECE);
    assert_eq!(drain(&mut rx), vec![Message::Choke]);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_release_abandons_stalled_piece() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE as usize);
    let config = SwarmConfig::default().with_release_wait(Duration::from_millis(100));
    let (ctx, conn, mut rx) = half_downloaded(temp.path(), &data, config).await;

    let started = Instant::now();
    conn.clone().release().await;
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(drain(&mut rx), vec![Message::Choke]);

    wait_for(|| !conn.is_downloading()).await;
    assert!(!ctx.group.have_piece(0));
    assert!(!ctx.group.stores()[0].downloading_pieces().has(0));
}

#[tokio::test]
async fn test_piece_finished_after_store_release_is_dropped() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE as usize);
    let (ctx, conn, _rx) = half_downloaded(temp.path(), &data, SwarmConfig::default()).await;

    ctx.group.release().await.unwrap();
    conn.handle_message(Message::Piece {
        index: 0,
        begin: 8192,
        data: Bytes::copy_from_slice(&data[8192..]),
    })
    .await
    .unwrap();

    wait_for(|| !conn.is_downloading()).await;
    assert!(!ctx.group.have_piece(0));
    assert!(ctx.task.error().is_none());
    assert_eq!(conn.session().statistics().downloaded(), 0);
}

#[tokio::test]
async fn test_junk_slices_do_not_score() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE as usize);
    let (_ctx, conn, _rx) = half_downloaded(temp.path(), &data, SwarmConfig::default()).await;
    assert_eq!(conn.download_mark(), 8192);

    for begin in [3, 8192 + 1, 0] {
        conn.handle_message(Message::Piece {
            index: 0,
            begin,
            data: Bytes::from(vec![0u8; 8192]),
        })
        .await
        .unwrap();
    }
    // short slice for the open slot
    conn.handle_message(Message::Piece {
        index: 0,
        begin: 8192,
        data: Bytes::from(vec![0u8; 100]),
    })
    .await
    .unwrap();

    assert_eq!(conn.download_mark(), 0);
    assert_eq!(conn.outstanding(), 1);
    assert!(conn.is_downloading());
}
