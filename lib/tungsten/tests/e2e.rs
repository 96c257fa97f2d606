//! End-to-end scenarios over real localhost TCP: bring-up, broadcast and
//! resume, driven through plain blocking client sockets.

use ember::logging;
use std::io;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use tungsten::protocol::{LoginPacket, LoginResponsePacket, MovePacket};
use tungsten::server::{DispatchHooks, Server, ServerOptions};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

fn start_server() -> Server {
    let options = ServerOptions {
        addr: "127.0.0.1:0".parse().unwrap(),
        io_threads: 2,
        local_threads: 2,
        pool_init: 1024,
    };

    Server::start(options, DispatchHooks::new(), &logging::discard()).expect("server start")
}

fn connect(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).expect("connect");
    stream.set_nodelay(true).expect("nodelay");
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .expect("read timeout");
    stream
}

fn login(stream: &mut TcpStream, usn: u64, token: u64, is_reconnect: bool) -> LoginResponsePacket {
    let request = LoginPacket {
        usn,
        token,
        is_reconnect,
    };

    let mut bytes = Vec::new();
    request.write(&mut bytes).unwrap();
    stream.write_all(&bytes).unwrap();

    let mut response = [0u8; LoginResponsePacket::SIZE];
    stream.read_exact(&mut response).expect("login response");
    LoginResponsePacket::read(&mut &response[..]).expect("login response decode")
}

#[test]
fn test_bring_up_and_new_login() {
    let server = start_server();
    let mut client = connect(&server);

    let response = login(&mut client, 7, 0, false);

    assert!(response.success);
    assert!(response.session_id >= 1);
    assert!(response.token >= 1);
}

#[test]
fn test_move_is_broadcast_excluding_sender() {
    let server = start_server();

    let mut sender = connect(&server);
    let mut receiver = connect(&server);

    let _sender_login = login(&mut sender, 21, 0, false);
    let _receiver_login = login(&mut receiver, 22, 0, false);

    let movement = MovePacket {
        client_id: 21,
        pos_x: 10.0,
        pos_y: 20.0,
        velocity_x: 1.0,
        velocity_y: -1.0,
        timestamp: 777,
    };

    let mut bytes = Vec::new();
    movement.write(&mut bytes).unwrap();
    sender.write_all(&bytes).unwrap();

    // The other client on the default map receives one copy, payload
    // intact.
    let mut received = [0u8; MovePacket::SIZE];
    receiver.read_exact(&mut received).expect("broadcast copy");
    let decoded = MovePacket::read(&mut &received[..]).unwrap();
    assert_eq!(decoded, movement);

    // The sender is excluded.
    sender
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let mut echo = [0u8; 1];
    let result = sender.read(&mut echo);
    match result {
        Ok(0) => panic!("server closed the sender"),
        Ok(_) => panic!("sender received its own broadcast"),
        Err(err) => assert!(
            err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut,
            "unexpected error {:?}",
            err
        ),
    }
}

#[test]
fn test_resume_within_window_restores_the_session() {
    let server = start_server();

    let mut first = connect(&server);
    let first_login = login(&mut first, 31, 0, false);
    assert!(first_login.success);

    drop(first);
    // Let the server notice and open the resume window.
    thread::sleep(Duration::from_millis(300));

    let counts = server.services().registry.connection_counts();
    assert_eq!(counts.waiting, 1);

    let mut second = connect(&server);
    let resumed = login(&mut second, 31, first_login.token, true);

    assert!(resumed.success);
    assert_eq!(resumed.session_id, first_login.session_id);
    assert_eq!(resumed.token, first_login.token);

    assert_eq!(
        server
            .services()
            .registry
            .reconnect_stats()
            .snapshot()
            .success,
        1
    );

    // Only the restored session remains once the temporary one is
    // harvested.
    thread::sleep(Duration::from_millis(100));
    let counts = server.services().registry.connection_counts();
    assert_eq!(counts.total, 1);
    assert_eq!(counts.connected, 1);
}

#[test]
fn test_malformed_header_closes_the_connection() {
    let server = start_server();
    let mut client = connect(&server);

    // size = 3 is under the header size: protocol error.
    client.write_all(&[3, 0, 1, 0]).unwrap();

    let mut buf = [0u8; 16];
    loop {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(err) => {
                assert!(
                    err.kind() == io::ErrorKind::ConnectionReset
                        || err.kind() == io::ErrorKind::BrokenPipe,
                    "unexpected error {:?}",
                    err
                );
                break;
            }
        }
    }
}
