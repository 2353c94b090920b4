// ABOUTME: Minimal hub probe: handshakes with a NetSIO hub and issues a disk-1 STATUS command
// ABOUTME: Useful for checking that a FujiNet-PC instance is reachable before wiring up an emulator

use netsio::{
    BridgeConfig, HostBus, LinkMode, Message, NetSioBridge, SioPort, TcpTransport, Transport,
    UdpTransport,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

struct NullHost;

impl HostBus for NullHost {
    fn schedule_serial_irq(&mut self, _cycles: u32) {}
    fn set_cpu_stall(&mut self, _stalled: bool) {}
}

fn usage() -> ! {
    eprintln!("usage: netsio_probe <udp|tcp> <hub-address:port>");
    std::process::exit(2);
}

fn run<T: Transport>(transport: T) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = NetSioBridge::new(transport, BridgeConfig::default());
    let mut port = SioPort::new(bridge);
    let mut host = NullHost;

    port.start(Instant::now())?;
    if port.bridge().transport().mode() == LinkMode::Datagram {
        // Nudge a quiet hub into the handshake; its AliveResponse marks
        // the session up even if it never pings us first.
        port.bridge_mut().transport_mut().send(&Message::AliveRequest)?;
    }

    // Wait for the handshake.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !port.bridge().is_connected() {
        if Instant::now() >= deadline {
            return Err("hub did not complete the handshake".into());
        }
        port.tick(&mut host, Instant::now());
        std::thread::sleep(Duration::from_millis(10));
    }
    println!("connected, {} send credits", port.bridge().send_credits());

    // Disk 1 STATUS.
    let now = Instant::now();
    for byte in [0x31, 0x53, 0x00, 0x00, 0x84] {
        port.put_byte(&mut host, byte, now);
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut response = Vec::new();
    while Instant::now() < deadline {
        let now = Instant::now();
        port.tick(&mut host, now);
        while let Some(byte) = port.get_byte(&mut host, now) {
            response.push(byte);
        }
        if port.is_idle() && !response.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    if response.is_empty() {
        return Err("no response from hub".into());
    }
    print!("response:");
    for byte in &response {
        print!(" {byte:02X}");
    }
    println!();
    let regs = port.status_registers();
    println!("status Y={} negative={}", regs.y, regs.negative);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        usage();
    }
    let addr: SocketAddr = args[2].parse()?;
    match args[1].as_str() {
        "udp" => run(UdpTransport::new("0.0.0.0:0".parse()?, Some(addr))),
        "tcp" => run(TcpTransport::new(addr)),
        _ => usage(),
    }
}
