use std::io::{Read, Write};
use std::net::TcpStream;

use rand::RngCore;

mod util;
use util::start_server;

fn echo_round_trip(num_threads: usize) {
    let harness = start_server(num_threads, |server| {
        server.set_message_callback(|conn, buffer, _receive_time| {
            let bytes = buffer.retrieve_all_as_bytes();
            conn.send(&bytes);
        });
    });

    let mut client = TcpStream::connect(harness.addr).unwrap();
    client.write_all(b"hello\n").unwrap();

    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\n");
}

#[test]
fn echo_one_worker() {
    echo_round_trip(1);
}

#[test]
fn echo_single_threaded_mode() {
    // Zero workers: the base loop serves the connection itself.
    echo_round_trip(0);
}

#[test]
fn echo_random_chunks() {
    let harness = start_server(2, |server| {
        server.set_message_callback(|conn, buffer, _receive_time| {
            let bytes = buffer.retrieve_all_as_bytes();
            conn.send(&bytes);
        });
    });

    let mut payload = vec![0u8; 64 * 1024];
    rand::rng().fill_bytes(&mut payload);

    let mut client = TcpStream::connect(harness.addr).unwrap();
    let mut echoed = vec![0u8; payload.len()];
    {
        let mut writer = client.try_clone().unwrap();
        let payload = payload.clone();
        let reader = std::thread::spawn(move || {
            for chunk in payload.chunks(4096) {
                writer.write_all(chunk).unwrap();
            }
        });
        client.read_exact(&mut echoed).unwrap();
        reader.join().unwrap();
    }
    assert_eq!(echoed, payload);
}

#[test]
fn echo_many_sequential_messages() {
    let harness = start_server(1, |server| {
        server.set_message_callback(|conn, buffer, _receive_time| {
            let bytes = buffer.retrieve_all_as_bytes();
            conn.send(&bytes);
        });
    });

    let mut client = TcpStream::connect(harness.addr).unwrap();
    for i in 0..100u32 {
        let msg = format!("message-{}\n", i);
        client.write_all(msg.as_bytes()).unwrap();
        let mut reply = vec![0u8; msg.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, msg.as_bytes());
    }
}
