//! Reconnecting bus connection and shared serial port, end to end.
//!
//! Demonstrates:
//! - Building a BusConnection over a simulated gateway that refuses the
//!   first two connection attempts
//! - Status observers and data point consumers
//! - Late subscribers receiving the cached value
//! - Reconnect with backoff and value resync on connect
//! - Two protocol instances sharing one serial port
//!
//! Usage:
//!   cargo run --example shared_bus
//!   cargo run --example shared_bus -- --debug

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use device_link::{
    BackoffConfig, BusConnection, ConnectionState, Error, LinkEvents, ManagerOptions,
    PhysicalResource, ResourceFactory, ResourceKey, SerialParams, SharedResourceManager,
    Transport,
};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Simulated Gateway
// ============================================================================

/// Gateway that answers reads with a fixed temperature and refuses the first
/// `refusals` connection attempts.
struct SimulatedGateway {
    refusals: usize,
    attempts: Arc<AtomicUsize>,
    events: Option<LinkEvents<&'static str, f32>>,
}

#[async_trait]
impl Transport for SimulatedGateway {
    type Address = &'static str;
    type Value = f32;

    async fn open(&mut self, events: LinkEvents<&'static str, f32>) -> device_link::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.refusals {
            return Err(Error::connection(format!("gateway busy (attempt {attempt})")));
        }
        self.events = Some(events);
        Ok(())
    }

    async fn close(&mut self) -> device_link::Result<()> {
        self.events = None;
        Ok(())
    }

    async fn write(&mut self, address: &&'static str, value: f32) -> device_link::Result<()> {
        check_group_address(address)?;
        let events = self.events.as_ref().ok_or(Error::ConnectionClosed)?;
        println!("    gateway <- {address} = {value}");
        events.value_received(address, Some(value));
        Ok(())
    }

    async fn request_read(&mut self, address: &&'static str) -> device_link::Result<()> {
        check_group_address(address)?;
        let events = self.events.clone();
        let address = *address;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(events) = events {
                events.value_received(&address, Some(21.5));
            }
        });
        Ok(())
    }
}

/// Accepts three-level group addresses such as `1/2/3`.
fn check_group_address(address: &str) -> device_link::Result<()> {
    let levels: Vec<_> = address.split('/').collect();
    if levels.len() != 3 || levels.iter().any(|level| level.parse::<u16>().is_err()) {
        return Err(Error::invalid_address(address, "expected main/middle/sub"));
    }
    Ok(())
}

// ============================================================================
// In-Memory Serial Port
// ============================================================================

struct EchoPort {
    rx: VecDeque<u8>,
    open: bool,
}

impl PhysicalResource for EchoPort {
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<usize> {
        self.rx.extend(data);
        Ok(data.len())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..read)) {
            *slot = byte;
        }
        Ok(read)
    }

    fn bytes_available(&self) -> io::Result<usize> {
        Ok(self.rx.len())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> io::Result<()> {
        self.open = false;
        Ok(())
    }
}

struct EchoPorts;

impl ResourceFactory for EchoPorts {
    type Params = SerialParams;
    type Resource = EchoPort;

    fn open(&self, descriptor: &str, params: &SerialParams) -> io::Result<EchoPort> {
        println!("    opening {descriptor} at {params}");
        Ok(EchoPort {
            rx: VecDeque::new(),
            open: true,
        })
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let debug = std::env::args().any(|a| a == "--debug");
    init_logging(debug);

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    println!("=== Shared Bus ===\n");

    // ========================================================================
    // Bus Connection
    // ========================================================================

    println!("[1] Connecting to a gateway that refuses twice...");

    let connection = BusConnection::builder()
        .endpoint("192.168.1.10:3671/tunnelling")
        .transport(SimulatedGateway {
            refusals: 2,
            attempts: Arc::new(AtomicUsize::new(0)),
            events: None,
        })
        .backoff(BackoffConfig::new().with_initial_delay(Duration::from_millis(100)))
        .build()?;

    connection.add_status_observer(Arc::new(|state: ConnectionState| {
        println!("    state: {state}");
    }));
    connection.subscribe(
        "1/2/3",
        Arc::new(|value: Option<&f32>| println!("    consumer A: 1/2/3 = {value:?}")),
    );

    connection.connect().await;
    connection
        .state_changes()
        .wait_for(|state| *state == ConnectionState::Connected)
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("    ✓ Connected\n");

    println!("[2] Late subscriber gets the cached value...");
    connection.subscribe(
        "1/2/3",
        Arc::new(|value: Option<&f32>| println!("    consumer B: 1/2/3 = {value:?}")),
    );
    println!();

    println!("[3] Writing...");
    connection.send("1/2/3", 22.0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!();

    println!("[4] Disconnecting...");
    connection.disconnect().await;
    println!("    ✓ {}\n", connection.state());

    // ========================================================================
    // Shared Serial Port
    // ========================================================================

    println!("[5] Two Modbus units on one RS485 line...");

    let manager = SharedResourceManager::new(EchoPorts, ManagerOptions::default())?;
    let key = ResourceKey::new("/dev/ttyUSB0", SerialParams::new(9600));

    let unit_1 = manager.acquire(key.clone()).await?;
    let unit_2 = manager.acquire(key.clone()).await?;
    println!("    {key} ref_count = {}", manager.ref_count(&key));

    let (reply_1, reply_2) = tokio::join!(
        unit_1.write_then_read(vec![0x01, 0x03], 2),
        unit_2.write_then_read(vec![0x02, 0x03], 2),
    );
    println!("    unit 1 reply: {:02x?}", reply_1?);
    println!("    unit 2 reply: {:02x?}", reply_2?);

    manager.release(&key);
    manager.release(&key);
    manager.await_pending_cleanups(Duration::from_secs(5)).await?;
    println!("    ✓ Port closed: {}\n", !unit_1.is_open().await);

    manager.shutdown().await;
    connection.shutdown().await;

    println!("=== Done ===");
    Ok(())
}

/// Initialize tracing/logging.
fn init_logging(debug: bool) {
    let filter = if debug {
        "device_link=debug"
    } else {
        "device_link=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}
