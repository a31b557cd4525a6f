//! Runs a connection between two namespaces joined by an in-memory link.
//!
//! # Usage
//!
//! Both namespaces queue their segments instead of sending them. The example moves the queues
//! across until the link is quiet, with a simulated clock advancing one millisecond per exchange.
//! A client connects to a listener, sends a message, both sides close and the client lingers in
//! time-wait until the clock passes its expiry.
//!
//!   > $ cargo run --example loopback -- 8080 "hello world"
//!
//! With `--mapped` the connection runs between IPv4 addresses, through their mapped form.
//!
//!   > $ cargo run --example loopback -- --mapped 8080 "hello world"
use std::sync::{Arc, Mutex};
use std::mem;
use structopt::StructOpt;

use tcp6::layer::tcp::{self, map, Family, Inbound, Inbound4, Namespace, State};
use tcp6::layer::tcp::provider::{Egress, OnLink, Outbound, Providers, SegmentEngine};
use tcp6::time::{Duration, Instant};
use tcp6::wire::{Ipv4Address, Ipv6Address, TcpSeqNumber};

fn main() {
    let Config {
        port,
        message,
        mapped,
    } = Config::from_args();

    let client_addr = Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);
    let server_addr = Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);
    let client_v4 = Ipv4Address::new(192, 168, 0, 1);
    let server_v4 = Ipv4Address::new(192, 168, 0, 2);

    let client = Host::new("client", client_addr, client_v4);
    let server = Host::new("server", server_addr, server_v4);
    let mut now = Instant::from_millis(0);

    let listener = server.ns.listen(tcp::ListenOptions {
        port,
        ..tcp::ListenOptions::default()
    }).unwrap();

    let socket = client.ns.socket(tcp::SocketOptions::default());
    let remote = if mapped { map(server_v4) } else { server_addr };
    client.ns.connect(&socket, remote, port, now).unwrap();
    exchange(&client, &server, &mut now);

    let accepted = server.ns.accept(&listener)
        .expect("Handshake did not complete");
    println!("Connected {}", socket.info().tuple);

    let mut data = message.as_bytes();
    while !data.is_empty() {
        let sent = client.ns.send(&socket, data, now).unwrap();
        exchange(&client, &server, &mut now);
        data = &data[sent..];
    }

    client.ns.close(&socket, now).unwrap();
    exchange(&client, &server, &mut now);
    server.ns.close(&accepted, now).unwrap();
    exchange(&client, &server, &mut now);
    println!("Client {}, server {}", socket.state(), accepted.state());

    for entry in client.ns.snapshot() {
        println!("client table: {:?} {} {} {:?}", entry.kind, entry.tuple, entry.state, entry.expires);
    }

    while let Some(deadline) = client.ns.next_deadline() {
        now = deadline;
        client.ns.poll(now);
    }
    assert_eq!(socket.state(), State::TimeWait);
    assert!(client.ns.snapshot().is_empty());
    println!("Time-wait expired at {}", now);

    println!("Received by server: {:?}", String::from_utf8_lossy(&server.received()));
    println!("Client stats: {:?}", client.ns.stats());
    println!("Server stats: {:?}", server.ns.stats());
}

#[derive(StructOpt)]
struct Config {
    /// Port of the listener.
    port: u16,
    /// Message sent by the client.
    message: String,
    /// Connect through IPv4-mapped addresses.
    #[structopt(short = "m", long = "mapped")]
    mapped: bool,
}

struct Host {
    name: &'static str,
    ns: Namespace,
    queue: Arc<Mutex<Vec<Outbound>>>,
    sink: Arc<Sink>,
}

/// Queues segments until `exchange` moves them.
struct Link(Arc<Mutex<Vec<Outbound>>>);

/// Collects the received stream, everything else is ignored.
#[derive(Default)]
struct Sink {
    data: Mutex<Vec<u8>>,
}

impl Host {
    fn new(name: &'static str, addr: Ipv6Address, v4: Ipv4Address) -> Self {
        let queue = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(Sink::default());
        let routing = OnLink {
            source: addr,
            source_v4: Some(map(v4)),
            mtu: 1500,
        };
        let providers = Providers::new(routing, Link(queue.clone()))
            .with_engine(SharedSink(sink.clone()));
        Host {
            name,
            ns: Namespace::new(tcp::Config::default(), providers),
            queue,
            sink,
        }
    }

    fn take(&self) -> Vec<Outbound> {
        mem::replace(&mut *self.queue.lock().unwrap(), Vec::new())
    }

    fn received(&self) -> Vec<u8> {
        self.sink.data.lock().unwrap().clone()
    }

    fn deliver(&self, packet: &Outbound, now: Instant) {
        let disposition = match packet.family {
            Family::Inet6 => self.ns.receive(Inbound {
                src: packet.src,
                dst: packet.dst,
                hop_limit: packet.hop_limit,
                traffic_class: packet.traffic_class,
                flow_label: packet.flow_label,
                iface: None,
                segment: &packet.segment,
            }, now),
            Family::Mapped => self.ns.receive_ipv4(Inbound4 {
                src: packet.src.as_ipv4().unwrap(),
                dst: packet.dst.as_ipv4().unwrap(),
                ttl: packet.hop_limit,
                tos: packet.traffic_class,
                iface: None,
                segment: &packet.segment,
            }, now),
        };
        println!("{} <- {} octets: {:?}", self.name, packet.segment.len(), disposition);
    }
}

impl Egress for Link {
    fn transmit(&self, packet: Outbound) {
        self.0.lock().unwrap().push(packet)
    }
}

struct SharedSink(Arc<Sink>);

impl SegmentEngine for SharedSink {
    fn transition(&self, socket: tcp::SocketId, from: State, to: State) {
        println!("socket {:?}: {} -> {}", socket, from, to);
    }

    fn receive(&self, _: tcp::SocketId, _: TcpSeqNumber, data: &[u8]) -> usize {
        self.0.data.lock().unwrap().extend_from_slice(data);
        data.len()
    }

    fn acknowledged(&self, _: tcp::SocketId, _: TcpSeqNumber) { }

    fn oldest_unacked(&self, _: tcp::SocketId, _: usize) -> Option<Vec<u8>> {
        // Nothing is lost on this link.
        None
    }

    fn retransmit(&self, _: tcp::SocketId, _: TcpSeqNumber, _: usize) { }

    fn probe(&self, _: tcp::SocketId) { }

    fn mss_changed(&self, _: tcp::SocketId, _: u16) { }
}

/// Move segments between both hosts until neither sends anything.
fn exchange(a: &Host, b: &Host, now: &mut Instant) {
    loop {
        let to_b = a.take();
        let to_a = b.take();
        if to_b.is_empty() && to_a.is_empty() {
            return;
        }
        *now += Duration::from_millis(1);
        for packet in to_b.iter() {
            b.deliver(packet, *now);
        }
        for packet in to_a.iter() {
            a.deliver(packet, *now);
        }
    }
}
