//! End-to-end domain controller discovery against a local responder

use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use polaris::resolver::buffer::BytePacketBuffer;
use polaris::resolver::context::{ResolverConfig, ResolverContext};
use polaris::resolver::protocol::{DnsPacket, DnsRecord, TransientTtl};
use polaris::resolver::security::{AnonymousCredentials, DisabledSecurityProvider};

/// Serve one SRV answer for whatever question arrives, echoing its id.
fn spawn_srv_responder() -> (u16, thread::JoinHandle<()>) {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).expect("Failed to bind responder");
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let port = socket.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let mut request = BytePacketBuffer::new();
        let (_, src) = socket.recv_from(&mut request.buf).expect("No request");
        let request = DnsPacket::from_buffer(&mut request).expect("Bad request");

        let mut response = DnsPacket::new();
        response.header.id = request.header.id;
        response.header.response = true;
        response.answers.push(DnsRecord::Srv {
            domain: request.questions[0].name.clone(),
            priority: 0,
            weight: 100,
            port: 389,
            host: "dc1.corp.local".to_string(),
            ttl: TransientTtl(600),
        });

        let buffer = response.to_buffer().expect("Failed to serialize");
        socket.send_to(&buffer.buffer, src).expect("Failed to send");
    });

    (port, handle)
}

#[test]
fn test_second_server_answers_after_first_times_out() {
    let (port, handle) = spawn_srv_responder();

    let mut config = ResolverConfig::default();
    config.domain_suffix = "corp.local".to_string();
    // nothing listens on 127.0.0.2; the locator must move on to 127.0.0.1
    config.dns_servers = vec!["127.0.0.2".parse().unwrap(), "127.0.0.1".parse().unwrap()];
    config.dns_port = port;
    config.timeout = Duration::from_millis(300);

    let context = ResolverContext::new(
        config,
        Arc::new(AnonymousCredentials),
        Arc::new(DisabledSecurityProvider),
    )
    .expect("Failed to build context");

    let controllers = context
        .locate_domain_controllers("")
        .expect("Discovery failed");

    assert_eq!(controllers[0], "dc1.corp.local");
    handle.join().unwrap();
}

#[test]
fn test_no_servers_reports_no_controllers() {
    let mut config = ResolverConfig::default();
    config.domain_suffix = "corp.local".to_string();
    config.timeout = Duration::from_millis(100);

    let context = ResolverContext::new(
        config,
        Arc::new(AnonymousCredentials),
        Arc::new(DisabledSecurityProvider),
    )
    .expect("Failed to build context");

    assert!(context.locate_domain_controllers("").is_err());
}
