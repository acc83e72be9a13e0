//! End-to-end wire tests: a real client socket speaking the legacy
//! framing against the registry, loops, and dispatcher.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use destiny_network::{io, ConnectionRegistry, Session};
use destiny_protocol::{Command, FrameDecoder, FrameEncoder};
use destiny_server::PacketDispatcher;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

async fn accept_session(
    listener: &TcpListener,
    registry: &ConnectionRegistry,
) -> Arc<Mutex<Session>> {
    let (stream, remote) = listener.accept().await.unwrap();
    stream.set_nodelay(true).unwrap();
    let local = stream.local_addr().unwrap();
    registry.register(stream, remote, local).unwrap()
}

/// Sweeps the receive pass until `done` reports true or a timeout hits.
async fn pump_until(
    registry: &ConnectionRegistry,
    dispatcher: &PacketDispatcher,
    mut done: impl FnMut() -> bool,
) {
    for _ in 0..500 {
        io::receive_pass(registry, dispatcher);
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for frames");
}

#[tokio::test]
async fn client_frames_reach_their_handler_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let registry = ConnectionRegistry::default();
    let dispatcher = PacketDispatcher::new();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    dispatcher.register(Command::Move, false, false, move |_, frame| {
        seen2.lock().push((frame.client_tick, frame.body.to_vec()));
        true
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let session = accept_session(&listener, &registry).await;

    let mut encoder = FrameEncoder::new();
    for tick in 0..5_u32 {
        encoder
            .append_frame(Command::Move, tick, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
    }
    client.write_all(&encoder.take()).await.unwrap();

    pump_until(&registry, &dispatcher, || seen.lock().len() == 5).await;

    let seen = seen.lock();
    for (tick, (got_tick, payload)) in seen.iter().enumerate() {
        assert_eq!(*got_tick, tick as u32);
        assert_eq!(payload, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    // Both directions advanced their rings in lockstep with the counts.
    assert_eq!(session.lock().recv_ring_position(), 5);
    assert_eq!(session.lock().stats().frames_received, 5);
}

#[tokio::test]
async fn handler_replies_travel_back_to_the_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let registry = ConnectionRegistry::default();
    let dispatcher = PacketDispatcher::new();

    // Echo the chat payload back at the sender.
    dispatcher.register(Command::Chat, false, false, |session, frame| {
        session
            .enqueue_frame(Command::Chat, frame.client_tick, &frame.body)
            .is_ok()
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let session = accept_session(&listener, &registry).await;

    let mut encoder = FrameEncoder::new();
    encoder.append_frame(Command::Chat, 9, b"hello world").unwrap();
    client.write_all(&encoder.take()).await.unwrap();

    pump_until(&registry, &dispatcher, || {
        session.lock().stats().frames_received == 1
    })
    .await;

    // Drain the reply to the socket.
    io::send_pass(&registry);
    assert_eq!(session.lock().stats().frames_sent, 1);

    let mut decoder = FrameDecoder::new();
    let mut frame = None;
    for _ in 0..500 {
        let mut chunk = [0_u8; 1024];
        match client.try_read(&mut chunk) {
            Ok(n) if n > 0 => decoder.queue_slice(&chunk[..n]),
            _ => {}
        }
        if let Some(found) = decoder.try_next_frame().unwrap() {
            frame = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let frame = frame.expect("echo frame");
    assert_eq!(frame.command, Command::Chat);
    assert_eq!(frame.client_tick, 9);
    assert_eq!(&frame.body[..], b"hello world");
}

#[tokio::test]
async fn corrupt_frames_are_dropped_without_killing_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let registry = ConnectionRegistry::default();
    let dispatcher = PacketDispatcher::new();

    let handled = Arc::new(AtomicUsize::new(0));
    let handled2 = Arc::clone(&handled);
    dispatcher.register(Command::Move, false, false, move |_, _| {
        handled2.fetch_add(1, Ordering::SeqCst);
        true
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let session = accept_session(&listener, &registry).await;

    // The corrupt frame comes from its own encoder so the good frame
    // still carries ring slot 0; a checksum failure never counts against
    // the ring on either end.
    let mut bad_encoder = FrameEncoder::new();
    bad_encoder.append_frame(Command::Move, 0, &[1, 2, 3]).unwrap();
    let mut bad = bad_encoder.take();
    bad[2] ^= 0xFF; // break the checksum

    let mut encoder = FrameEncoder::new();
    encoder.append_frame(Command::Move, 1, &[4, 5, 6]).unwrap();
    let good = encoder.take();

    client.write_all(&bad).await.unwrap();
    client.write_all(&good).await.unwrap();

    pump_until(&registry, &dispatcher, || handled.load(Ordering::SeqCst) == 1).await;

    let session = session.lock();
    assert!(session.is_active(), "session survives a corrupt frame");
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}
