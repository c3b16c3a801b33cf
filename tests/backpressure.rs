use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

mod util;
use util::{await_count, start_server};

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

const BIG: usize = 8 * 1024 * 1024;
const HIGH_WATER_MARK: usize = 4096;

// A send that outruns the socket buffers must cross the high-water mark
// exactly once, then report write-complete exactly once after the peer
// drains everything.
#[test]
fn partial_write_reports_high_water_and_write_complete_once() {
    let high_waters = Arc::new(AtomicUsize::new(0));
    let high_water_size = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));

    let harness = {
        let high_waters = high_waters.clone();
        let high_water_size = high_water_size.clone();
        let write_completes = write_completes.clone();
        start_server(1, move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    let high_waters = high_waters.clone();
                    let high_water_size = high_water_size.clone();
                    conn.set_high_water_mark_callback(
                        move |conn, size| {
                            assert!(conn.owner_loop().is_in_loop_thread());
                            high_water_size.store(size, Ordering::SeqCst);
                            high_waters.fetch_add(1, Ordering::SeqCst);
                        },
                        HIGH_WATER_MARK,
                    );
                }
            });
            server.set_message_callback(|conn, buffer, _receive_time| {
                buffer.retrieve_all();
                conn.send(&patterned(BIG));
            });
            server.set_write_complete_callback(move |_conn| {
                write_completes.fetch_add(1, Ordering::SeqCst);
            });
        })
    };

    let mut client = TcpStream::connect(harness.addr).unwrap();
    client.write_all(b"go").unwrap();

    // Let the server's direct write fill the socket buffers and fall back
    // to the output buffer before draining.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(high_waters.load(Ordering::SeqCst), 1);
    assert!(high_water_size.load(Ordering::SeqCst) >= HIGH_WATER_MARK);

    let mut received = vec![0u8; BIG];
    client.read_exact(&mut received).unwrap();
    assert_eq!(received, patterned(BIG));

    await_count("the write-complete callback", &write_completes, 1);
    // Drained once, reported once.
    assert_eq!(high_waters.load(Ordering::SeqCst), 1);
}

// Shutdown with megabytes still buffered: every byte is delivered before
// the write half closes, and exactly one disconnect callback follows.
#[test]
fn graceful_shutdown_flushes_pending_output() {
    const PAYLOAD: usize = 8 * 1024 * 1024;

    let disconnects = Arc::new(AtomicUsize::new(0));
    let was_writing = Arc::new(Mutex::new(None));

    let harness = {
        let disconnects = disconnects.clone();
        let was_writing = was_writing.clone();
        start_server(1, move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    conn.send(&patterned(PAYLOAD));
                    *was_writing.lock().unwrap() = Some(conn.is_writing());
                    conn.shutdown();
                } else {
                    disconnects.fetch_add(1, Ordering::SeqCst);
                }
            });
        })
    };

    let mut client = TcpStream::connect(harness.addr).unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert_eq!(received, patterned(PAYLOAD));

    // Eight megabytes cannot clear the socket buffers in one write.
    assert_eq!(*was_writing.lock().unwrap(), Some(true));

    // The write half is closed; finish the handshake from our side.
    drop(client);
    await_count("the disconnect callback", &disconnects, 1);
}

// Small sends that never cross the threshold never fire the callback.
#[test]
fn below_threshold_sends_skip_high_water_callback() {
    let high_waters = Arc::new(AtomicUsize::new(0));

    let harness = {
        let high_waters = high_waters.clone();
        start_server(1, move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    let high_waters = high_waters.clone();
                    conn.set_high_water_mark_callback(
                        move |_conn, _size| {
                            high_waters.fetch_add(1, Ordering::SeqCst);
                        },
                        HIGH_WATER_MARK,
                    );
                }
            });
            server.set_message_callback(|conn, buffer, _receive_time| {
                let bytes = buffer.retrieve_all_as_bytes();
                conn.send(&bytes);
            });
        })
    };

    let mut client = TcpStream::connect(harness.addr).unwrap();
    for _ in 0..16 {
        client.write_all(b"tiny").unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"tiny");
    }
    assert_eq!(high_waters.load(Ordering::SeqCst), 0);
}
