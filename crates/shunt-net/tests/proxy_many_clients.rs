use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use shunt_net::tcp::{Server, bind_listener};

const WORKERS: usize = 100;
const CONNECTIONS_PER_WORKER: usize = 5;

fn start_proxy(upstream: SocketAddr) -> SocketAddr {
    let listener = bind_listener("127.0.0.1:0".parse().unwrap()).expect("failed to bind proxy");
    let mut server = Server::new(listener, upstream).expect("failed to set up proxy");
    let addr = server.local_addr().expect("failed to fetch proxy addr");
    thread::spawn(move || server.run().expect("proxy loop failed"));
    addr
}

fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind upstream");
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

#[test]
fn hundreds_of_clients_all_complete() {
    let upstream = spawn_echo_upstream();
    let proxy = start_proxy(upstream);

    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            thread::spawn(move || {
                for round in 0..CONNECTIONS_PER_WORKER {
                    let payload = vec![(worker * 31 + round) as u8; 1024];

                    let mut client = TcpStream::connect(proxy).expect("connect failed");
                    client.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
                    client.write_all(&payload).expect("write failed");

                    let mut echoed = vec![0u8; payload.len()];
                    client.read_exact(&mut echoed).expect("echo read failed");
                    assert_eq!(echoed, payload);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("client worker panicked");
    }
}
