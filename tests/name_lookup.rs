//! Forward lookup through the method registry against a local responder

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use polaris::resolver::buffer::BytePacketBuffer;
use polaris::resolver::context::{ResolverConfig, ServerTable};
use polaris::resolver::engine::MethodRegistry;
use polaris::resolver::method::DnsMethod;
use polaris::resolver::protocol::{DnsPacket, DnsRecord, QueryType, TransientTtl};

fn registry_with_one_server(port: u16, timeout: Duration) -> MethodRegistry {
    let mut config = ResolverConfig::default();
    config.domain_suffix = "corp.local".to_string();
    config.dns_servers = vec!["127.0.0.1".parse().unwrap()];
    config.dns_port = port;
    config.timeout = timeout;
    let table = Arc::new(ServerTable::new(&config));

    let registry = MethodRegistry::new();
    let method = Arc::new(DnsMethod::unicast(table));
    registry.register(method.descriptor(), "127.0.0.1".parse().unwrap(), method);
    registry
}

#[test]
fn test_forward_lookup_returns_answer() {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).expect("Failed to bind");
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let port = socket.local_addr().unwrap().port();

    let responder = thread::spawn(move || {
        // an A and an AAAA query arrive; answer the A one
        for _ in 0..2 {
            let mut request = BytePacketBuffer::new();
            let (_, src) = socket.recv_from(&mut request.buf).expect("No query");
            let request = DnsPacket::from_buffer(&mut request).expect("Bad query");

            if request.questions[0].qtype != QueryType::A {
                continue;
            }

            let mut response = DnsPacket::new();
            response.header.id = request.header.id;
            response.header.response = true;
            response.questions = request.questions.clone();
            response.answers.push(DnsRecord::A {
                domain: request.questions[0].name.clone(),
                addr: "10.0.0.5".parse().unwrap(),
                ttl: TransientTtl(300),
            });

            let buffer = response.to_buffer().expect("Failed to serialize");
            socket.send_to(&buffer.buffer, src).expect("Failed to send");
            return;
        }
        panic!("No A query arrived");
    });

    let registry = registry_with_one_server(port, Duration::from_secs(2));
    let addrs = registry.resolve_name("fs1").expect("Lookup failed");

    assert_eq!(addrs, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
    responder.join().unwrap();
}

#[test]
fn test_stray_reply_does_not_stretch_the_timeout() {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).expect("Failed to bind");
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let port = socket.local_addr().unwrap().port();

    let responder = thread::spawn(move || {
        let mut request = BytePacketBuffer::new();
        let (_, src) = socket.recv_from(&mut request.buf).expect("No query");

        // a late datagram with a foreign id forces another receive round;
        // the remaining budget for that round must shrink accordingly
        thread::sleep(Duration::from_millis(300));
        let mut stray = DnsPacket::new();
        stray.header.id = 0xFFFF;
        stray.header.response = true;
        let buffer = stray.to_buffer().expect("Failed to serialize");
        socket.send_to(&buffer.buffer, src).expect("Failed to send");
    });

    let registry = registry_with_one_server(port, Duration::from_millis(400));

    let started = Instant::now();
    assert!(registry.resolve_name("fs1").is_err());
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(600),
        "lookup took {:?}, longer than its 400ms budget allows",
        elapsed
    );
    responder.join().unwrap();
}
