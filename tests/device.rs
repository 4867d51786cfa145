use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser as _;
use helios_vallox_tools::connection::{Args, DeviceClient, Error};
use helios_vallox_tools::guard::OperationGuard;
use helios_vallox_tools::registers::{Kind, Mode, RegisterCatalog, RegisterEntry};
use helios_vallox_tools::value::{self, Value};
use helios_vallox_tools::{bus, telegram};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Seen {
    Telegram([u8; 6]),
    Byte(u8),
}

/// A mainboard sitting behind an RS-485 bridge.
#[derive(Default)]
struct Mainboard {
    registers: Mutex<Vec<u8>>,
    seen: Mutex<Vec<Seen>>,
    connections: Mutex<usize>,
    /// Registers the mainboard never answers for.
    silent: Vec<u8>,
    mute: bool,
    /// Something else on the bus sending these bytes at this interval.
    chatter: Option<(Duration, Vec<u8>)>,
}

impl Mainboard {
    fn new() -> Self {
        Self { registers: Mutex::new(vec![0; 256]), ..Default::default() }
    }

    fn with_register(self, address: u8, raw: u8) -> Self {
        self.registers.lock().unwrap()[usize::from(address)] = raw;
        self
    }

    fn register(&self, address: u8) -> u8 {
        self.registers.lock().unwrap()[usize::from(address)]
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn read_requests_for(&self, register: u8) -> usize {
        let request = telegram::Telegram::read_request(register).to_bytes();
        self.seen().iter().filter(|s| **s == Seen::Telegram(request)).count()
    }

    /// Consume complete telegrams and lone bytes, returning the replies to send.
    fn handle(&self, buffer: &mut Vec<u8>) -> Vec<[u8; 6]> {
        let mut replies = Vec::new();
        loop {
            let Some(&first) = buffer.first() else { break };
            if first != telegram::START {
                buffer.remove(0);
                self.seen.lock().unwrap().push(Seen::Byte(first));
                continue;
            }
            let Some(bytes) = buffer.first_chunk::<6>().copied() else { break };
            buffer.drain(..6);
            self.seen.lock().unwrap().push(Seen::Telegram(bytes));
            let [_, sender, receiver, register, data, _] = bytes;
            if receiver != 0x11 {
                continue;
            }
            if register == 0 && sender == 0x2E {
                if self.mute || self.silent.contains(&data) {
                    continue;
                }
                let value = self.register(data);
                let checksum = telegram::checksum(&[0x01, 0x11, 0x2E, data, value]);
                replies.push([0x01, 0x11, 0x2E, data, value, checksum]);
            } else if register != 0 {
                self.registers.lock().unwrap()[usize::from(register)] = data;
            }
        }
        replies
    }

    async fn serve(self: Arc<Self>, mut socket: TcpStream) {
        let mut buffer = Vec::new();
        let mut chunk = [0; 64];
        let (period, noise) = self.chatter.clone().unwrap_or((Duration::from_secs(3600), vec![]));
        let mut chatter = tokio::time::interval(period);
        chatter.tick().await;
        loop {
            tokio::select! {
                read = socket.read(&mut chunk) => {
                    let count = match read {
                        Ok(0) | Err(_) => return,
                        Ok(count) => count,
                    };
                    buffer.extend_from_slice(&chunk[..count]);
                    for reply in self.handle(&mut buffer) {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        if socket.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                }
                _ = chatter.tick(), if !noise.is_empty() => {
                    if socket.write_all(&noise).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn spawn(self) -> (Arc<Self>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let mainboard = Arc::new(self);
        let server = Arc::clone(&mainboard);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                *server.connections.lock().unwrap() += 1;
                tokio::spawn(Arc::clone(&server).serve(socket));
            }
        });
        (mainboard, address)
    }
}

fn args(address: SocketAddr, extra: &[&str]) -> Args {
    let port = address.port().to_string();
    let mut argv = vec!["test", "--host", "127.0.0.1", "--port", port.as_str()];
    argv.extend_from_slice(&["--reply-timeout", "50ms"]);
    argv.extend_from_slice(extra);
    Args::parse_from(argv)
}

#[tokio::test]
async fn read_value_decodes_the_reply() {
    let mainboard = Mainboard::new().with_register(0x29, 3).with_register(0x34, 165);
    let (mainboard, address) = mainboard.spawn().await;
    let mut client = DeviceClient::new(args(address, &[]));
    client.connect().await.unwrap();
    assert_eq!(client.read_value("fanspeed").await.unwrap(), Value::FanSpeed(2));
    assert_eq!(client.read_value("temperature_extract_air").await.unwrap(), Value::Celsius(22));
    assert_eq!(client.cached_raw(0x29), Some(3));
    client.disconnect().await;
    assert_eq!(client.cached_raw(0x29), None);
    assert_eq!(
        mainboard.seen()[0],
        Seen::Telegram([0x01, 0x2E, 0x11, 0x00, 0x29, 0x69])
    );
}

#[tokio::test]
async fn reading_without_a_connection_fails() {
    let mut client = DeviceClient::new(args("127.0.0.1:9".parse().unwrap(), &[]));
    assert!(matches!(client.read_value("fanspeed").await, Err(Error::NotConnected)));
    assert!(matches!(client.read_all_values().await, Err(Error::NotConnected)));
    assert!(matches!(
        client.read_value("no_such_variable").await,
        Err(Error::UnknownVariable(name)) if name == "no_such_variable"
    ));
}

#[tokio::test]
async fn snapshot_skips_a_register_that_never_answers() {
    let mainboard = Mainboard {
        silent: vec![0x36],
        // FB1 reporting a fan speed level now and then.
        chatter: Some((Duration::from_millis(35), vec![0x01, 0x21, 0x11, 0x29, 0x03, 0x5F])),
        ..Mainboard::new()
    }
    .with_register(0x32, 115)
    .with_register(0x35, 160)
    .with_register(0x34, 165)
    .with_register(0x33, 131)
    .with_register(0xA3, 0x09)
    .with_register(0x29, 7)
    .with_register(0xA9, 1)
    .with_register(0xA5, 255);
    let (mainboard, address) = mainboard.spawn().await;
    let guard = OperationGuard::with_lock(Default::default(), Duration::from_secs(20));
    let mut client = DeviceClient::new(args(address, &[]));
    let snapshot = guard.read_all_values(&mut client).await.unwrap();

    assert_eq!(snapshot.get("temperature_outdoor_air"), Some(Value::Celsius(5)));
    assert_eq!(snapshot.get("temperature_exhaust_air"), Some(Value::Celsius(10)));
    assert_eq!(snapshot.get("fanspeed"), Some(Value::FanSpeed(3)));
    assert_eq!(snapshot.get("powerstate"), Some(Value::Flag(true)));
    assert_eq!(snapshot.get("co2_indicator"), Some(Value::Flag(false)));
    assert_eq!(snapshot.get("winter_mode"), Some(Value::Flag(true)));
    assert_eq!(snapshot.get("fault_number"), None);
    assert_eq!(snapshot.fault_text(), None);
    let metrics = snapshot.heat_recovery().unwrap();
    assert_eq!(metrics.temperature_reduction, 12);
    assert_eq!(metrics.temperature_gain, 15);
    assert_eq!(metrics.temperature_balance, -3);
    assert_eq!(metrics.efficiency, 88);

    assert_eq!(mainboard.read_requests_for(0x36), 3);
    assert_eq!(mainboard.read_requests_for(0xA3), 1);
    let expected = RegisterCatalog::standard()
        .entries()
        .iter()
        .filter(|e| e.address != 0x36)
        .count();
    assert_eq!(snapshot.len(), expected);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn writing_a_flag_keeps_the_other_flags() {
    let (mainboard, address) = Mainboard::new().with_register(0xA3, 0x88).spawn().await;
    let mut client = DeviceClient::new(args(address, &[]));
    client.connect().await.unwrap();
    client.write_value("powerstate", Value::Flag(true)).await.unwrap();
    assert_eq!(client.cached_raw(0xA3), Some(0x89));
    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        mainboard.seen(),
        vec![
            Seen::Telegram([0x01, 0x2E, 0x11, 0x00, 0xA3, 0xE3]),
            Seen::Telegram([0x01, 0x2E, 0x20, 0xA3, 0x89, 0x7B]),
            Seen::Telegram([0x01, 0x2E, 0x10, 0xA3, 0x89, 0x6B]),
            Seen::Telegram([0x01, 0x2E, 0x11, 0xA3, 0x89, 0x6C]),
            Seen::Byte(0x6C),
        ]
    );
    assert_eq!(mainboard.register(0xA3), 0x89);
}

#[tokio::test]
async fn writing_a_number_needs_no_read() {
    let (mainboard, address) = Mainboard::new().with_register(0x29, 1).spawn().await;
    let guard = OperationGuard::with_lock(Default::default(), Duration::from_secs(5));
    let mut client = DeviceClient::new(args(address, &[]));
    guard.write_value(&mut client, "fanspeed", Value::FanSpeed(6)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let seen = mainboard.seen();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[2], Seen::Telegram([0x01, 0x2E, 0x11, 0x29, 63, 0xA8]));
    assert_eq!(mainboard.register(0x29), 63);
    assert_eq!(guard.read_value(&mut client, "fanspeed").await.unwrap(), Value::FanSpeed(6));
}

#[tokio::test]
async fn write_protected_register_is_never_sent() {
    let (mainboard, address) = Mainboard::new().spawn().await;
    let catalog = RegisterCatalog::from_entries(vec![RegisterEntry {
        name: "dangerous",
        address: 0x06,
        kind: Kind::Decimal,
        mode: Mode::RW,
        minimum: None,
        maximum: None,
        description: "",
    }])
    .unwrap();
    let mut client = DeviceClient::with_catalog(args(address, &[]), catalog);

    let result = client.write_value("dangerous", Value::Number(1)).await;
    assert!(matches!(result, Err(Error::SafetyBlocked { address: 0x06, .. })), "{result:?}");

    let guard = OperationGuard::with_lock(Default::default(), Duration::from_secs(5));
    let result = guard.write_value(&mut client, "dangerous", Value::Number(1)).await;
    assert!(matches!(result, Err(Error::SafetyBlocked { .. })), "{result:?}");
    assert_eq!(*mainboard.connections.lock().unwrap(), 0);

    client.connect().await.unwrap();
    let result = client.write_value("dangerous", Value::Number(1)).await;
    assert!(matches!(result, Err(Error::SafetyBlocked { .. })), "{result:?}");
    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(mainboard.seen().is_empty());
}

#[tokio::test]
async fn invalid_writes_are_rejected_before_any_traffic() {
    let (mainboard, address) = Mainboard::new().spawn().await;
    let mut client = DeviceClient::new(args(address, &[]));
    client.connect().await.unwrap();
    let result = client.write_value("temperature_outdoor_air", Value::Celsius(5)).await;
    assert!(matches!(result, Err(Error::ReadOnly("temperature_outdoor_air"))), "{result:?}");
    let result = client.write_value("nope", Value::Number(1)).await;
    assert!(matches!(result, Err(Error::UnknownVariable(_))), "{result:?}");
    let result = client.write_value("input_fan_percent", Value::Number(50)).await;
    assert!(
        matches!(result, Err(Error::Value { source: value::Error::OutOfRange { .. }, .. })),
        "{result:?}"
    );
    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(mainboard.seen().is_empty());

    let result = client.write_value("powerstate", Value::Flag(true)).await;
    assert!(
        matches!(
            result,
            Err(Error::Value { source: value::Error::BitWithoutPriorRead(0xA3), .. })
        ),
        "{result:?}"
    );
}

#[tokio::test]
async fn busy_bus_fails_the_read() {
    let mainboard = Mainboard {
        chatter: Some((Duration::from_millis(2), vec![0xAA])),
        ..Mainboard::new()
    };
    let (mainboard, address) = mainboard.spawn().await;
    let extra = ["--arbitration-ceiling", "100ms", "--attempts", "2"];
    let mut client = DeviceClient::new(args(address, &extra));
    client.connect().await.unwrap();
    let started = Instant::now();
    let result = client.read_value("fanspeed").await;
    match result {
        Err(Error::ReadFailed { attempts: 2, source, .. }) => {
            assert!(matches!(*source, Error::Bus(bus::Error::Busy { .. })), "{source:?}");
        }
        other => panic!("expected the read to fail, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(mainboard.read_requests_for(0x29), 0);
    client.disconnect().await;
}

#[tokio::test]
async fn deadline_abandons_the_operation() {
    let (_mainboard, address) = Mainboard { mute: true, ..Mainboard::new() }.spawn().await;
    let guard = OperationGuard::with_lock(Default::default(), Duration::from_millis(300));
    let mut client = DeviceClient::new(args(address, &[]));
    let started = Instant::now();
    let result = guard.read_all_values(&mut client).await;
    assert!(matches!(result, Err(Error::Timeout(_))), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn operations_sharing_a_lock_do_not_overlap() {
    let (_mainboard, address) = Mainboard::new().with_register(0x29, 1).spawn().await;
    let lock = Arc::new(tokio::sync::Mutex::new(()));
    let spans = Arc::new(Mutex::new(Vec::new()));
    let mut operations = Vec::new();
    for _ in 0..3 {
        let guard = OperationGuard::with_lock(Arc::clone(&lock), Duration::from_secs(5));
        let spans = Arc::clone(&spans);
        let args = args(address, &[]);
        operations.push(async move {
            let mut client = DeviceClient::new(args);
            guard
                .invoke(&mut client, async |client: &mut DeviceClient| {
                    let started = Instant::now();
                    let value = client.read_value("fanspeed").await?;
                    spans.lock().unwrap().push((started, Instant::now()));
                    Ok(value)
                })
                .await
        });
    }
    for result in futures::future::join_all(operations).await {
        assert_eq!(result.unwrap(), Value::FanSpeed(1));
    }
    let mut spans = spans.lock().unwrap().clone();
    spans.sort();
    assert_eq!(spans.len(), 3);
    for pair in spans.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{pair:?}");
    }
}
