mod common;

use async_trait::async_trait;
use common::{recording_context, yaml};
use helios::error::{HeliosError, Result};
use helios::modbus::{self, Connection, Protocol, Request, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// In-memory register bank shared between a test and its fake transport
#[derive(Clone, Default)]
struct Bus {
    registers: Arc<Mutex<HashMap<u16, u16>>>,
    coils: Arc<Mutex<HashMap<u16, bool>>>,
    calls: Arc<AtomicUsize>,
    resets: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

impl Bus {
    fn with_registers(values: &[(u16, u16)]) -> Self {
        let bus = Bus::default();
        bus.registers.lock().extend(values.iter().copied());
        bus
    }

    fn register(&self, address: u16) -> Option<u16> {
        self.registers.lock().get(&address).copied()
    }
}

struct FakeTransport {
    bus: Bus,
    failures: usize,
    hang: bool,
    connected: bool,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn call(&mut self, _slave: u8, request: &Request) -> Result<Vec<u8>> {
        self.bus.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.failures > 0 {
            self.failures -= 1;
            return Err(HeliosError::io("broken pipe"));
        }

        match request {
            Request::ReadHoldingRegisters { address, count }
            | Request::ReadInputRegisters { address, count } => {
                if *address == 999 {
                    return Err(HeliosError::modbus("exception IllegalDataAddress"));
                }
                let registers = self.bus.registers.lock();
                Ok((0..*count)
                    .flat_map(|i| {
                        registers
                            .get(&(address + i))
                            .copied()
                            .unwrap_or(0)
                            .to_be_bytes()
                    })
                    .collect())
            }
            Request::ReadCoils { address, .. } => {
                let on = self.bus.coils.lock().get(address).copied().unwrap_or(false);
                Ok(vec![u8::from(on)])
            }
            Request::WriteSingleRegister { address, value } => {
                self.bus.registers.lock().insert(*address, *value);
                Ok(Vec::new())
            }
            Request::WriteMultipleRegisters { address, values } => {
                let mut registers = self.bus.registers.lock();
                for (i, value) in values.iter().enumerate() {
                    registers.insert(address + i as u16, *value);
                }
                Ok(Vec::new())
            }
            Request::WriteSingleCoil { address, on } => {
                self.bus.coils.lock().insert(*address, *on);
                Ok(Vec::new())
            }
        }
    }

    async fn connect(&mut self) -> Result<bool> {
        if self.connected {
            return Ok(false);
        }
        self.bus.connects.fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        Ok(true)
    }

    fn reset(&mut self) {
        self.bus.resets.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
    }
}

fn attach(key: &str, bus: &Bus, failures: usize, hang: bool) -> Arc<Connection> {
    let bus = bus.clone();
    modbus::register_connection(key, Protocol::Tcp, move || {
        Ok(Box::new(FakeTransport {
            bus,
            failures,
            hang,
            connected: false,
        }) as Box<dyn Transport>)
    })
    .unwrap()
}

#[tokio::test]
async fn holding_register_read_is_decoded_and_scaled() {
    let bus = Bus::with_registers(&[(100, 0x0000), (101, 0x04D2)]);
    let _conn = attach("fake-read:502", &bus, 0, false);

    let (ctx, _) = recording_context();
    let cfg = yaml(
        "source: modbus\nuri: fake-read:502\nid: 1\nregister: { address: 100, type: holding, encoding: int32 }\nscale: 0.1\n",
    );
    let float = ctx.float_getter(&cfg).await.unwrap();
    let int = ctx.int_getter(&cfg).await.unwrap();
    assert_eq!(float().await.unwrap(), 123.4);
    assert_eq!(int().await.unwrap(), 123);
    assert_eq!(bus.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn string_and_bool_reads() {
    let bus = Bus::with_registers(&[(10, 0x0000), (11, 0x534E), (12, 0x3132), (20, 0x0004)]);
    let _conn = attach("fake-text:502", &bus, 0, false);

    let (ctx, _) = recording_context();
    let serial = yaml(
        "source: modbus\nuri: fake-text:502\nregister: { address: 10, type: input, encoding: uint64 }\n",
    );
    let get = ctx.string_getter(&serial).await.unwrap();
    assert_eq!(get().await.unwrap(), "SN12");

    let flag = yaml(
        "source: modbus\nuri: fake-text:502\nregister: { address: 20, type: holding, encoding: bool16, bitmask: '0x0004' }\n",
    );
    let get = ctx.bool_getter(&flag).await.unwrap();
    assert!(get().await.unwrap());
}

#[tokio::test]
async fn writes_encode_values() {
    let bus = Bus::default();
    let _conn = attach("fake-write:502", &bus, 0, false);
    let (ctx, _) = recording_context();

    let multiple = yaml(
        "source: modbus\nuri: fake-write:502\nregister: { address: 200, type: writemultiple, encoding: float32 }\n",
    );
    let set = ctx.float_setter(&multiple, "power").await.unwrap();
    set(1.5).await.unwrap();
    assert_eq!(bus.register(200), Some(0x3FC0));
    assert_eq!(bus.register(201), Some(0x0000));

    let single = yaml(
        "source: modbus\nuri: fake-write:502\nregister: { address: 300, type: writesingle, encoding: int16 }\nscale: 10\n",
    );
    let set = ctx.int_setter(&single, "current").await.unwrap();
    set(-2).await.unwrap();
    assert_eq!(bus.register(300), Some((-20i16) as u16));
    assert!(ctx.float_setter(&single, "current").await.is_err());

    let coil = yaml(
        "source: modbus\nuri: fake-write:502\nregister: { address: 5, type: writecoil, encoding: bool8 }\n",
    );
    let set = ctx.bool_setter(&coil, "enable").await.unwrap();
    set(true).await.unwrap();
    assert_eq!(bus.coils.lock().get(&5), Some(&true));

    // write registers offer no getters
    assert!(ctx.float_getter(&coil).await.is_err());
}

#[tokio::test]
async fn broken_link_is_retried_once() {
    let bus = Bus::with_registers(&[(1, 42)]);
    let _conn = attach("fake-flaky:502", &bus, 1, false);
    let (ctx, _) = recording_context();
    let cfg = yaml(
        "source: modbus\nuri: fake-flaky:502\nregister: { address: 1, type: holding, encoding: uint16 }\n",
    );
    let get = ctx.int_getter(&cfg).await.unwrap();
    assert_eq!(get().await.unwrap(), 42);
    assert_eq!(bus.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exceptions_are_not_retried() {
    let bus = Bus::default();
    let _conn = attach("fake-exception:502", &bus, 0, false);
    let (ctx, _) = recording_context();
    let cfg = yaml(
        "source: modbus\nuri: fake-exception:502\nregister: { address: 999, type: holding, encoding: uint16 }\n",
    );
    let get = ctx.float_getter(&cfg).await.unwrap();
    assert!(matches!(get().await, Err(HeliosError::Modbus { .. })));
    assert_eq!(bus.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_request_times_out_and_resets_link() {
    let bus = Bus::default();
    let _conn = attach("fake-hang:502", &bus, 0, true);
    let (ctx, _) = recording_context();
    let cfg = yaml(
        "source: modbus\nuri: fake-hang:502\ntimeout: 500ms\nregister: { address: 1, type: holding, encoding: uint16 }\n",
    );
    let get = ctx.float_getter(&cfg).await.unwrap();
    assert!(get().await.unwrap_err().is_timeout());
    assert_eq!(bus.resets.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn fresh_link_waits_connect_delay() {
    let bus = Bus::with_registers(&[(1, 7)]);
    let _conn = attach("fake-settle:502", &bus, 0, false);
    let (ctx, _) = recording_context();
    let cfg = yaml(
        "source: modbus\nuri: fake-settle:502\nconnectdelay: 3s\nregister: { address: 1, type: holding, encoding: uint16 }\n",
    );
    let get = ctx.int_getter(&cfg).await.unwrap();

    let started = Instant::now();
    assert_eq!(get().await.unwrap(), 7);
    assert!(started.elapsed() >= Duration::from_secs(3));

    // an open link is used right away
    let started = Instant::now();
    assert_eq!(get().await.unwrap(), 7);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(bus.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn link_protocol_conflict_is_rejected() {
    let bus = Bus::default();
    let _conn = attach("fake-shared:502", &bus, 0, false);
    let (ctx, _) = recording_context();
    let rtu = yaml(
        "source: modbus\nuri: fake-shared:502\nrtu: true\nregister: { address: 1, type: holding, encoding: uint16 }\n",
    );
    let err = ctx.float_getter(&rtu).await.err().unwrap();
    assert!(err.to_string().contains("different protocol"));
}

#[tokio::test]
async fn invalid_register_descriptors_fail_at_construction() {
    let (ctx, _) = recording_context();
    for register in [
        "{ address: 1, type: holding }",
        "{ address: 1, type: discrete, encoding: int16 }",
        "{ address: 1, type: holding, encoding: int16, decode: int16 }",
    ] {
        let cfg = yaml(&format!(
            "source: modbus\nuri: fake-invalid:502\nregister: {}\n",
            register
        ));
        assert!(ctx.float_getter(&cfg).await.is_err(), "{register}");
    }
    assert!(
        ctx.float_getter(&yaml("source: modbus\nregister: { address: 1, type: holding, encoding: int16 }\n"))
            .await
            .is_err()
    );
}

fn sunspec_bus() -> Bus {
    Bus::with_registers(&[
        (40000, 0x5375),
        (40001, 0x6E53),
        // common model
        (40002, 1),
        (40003, 2),
        // inverter model, scale factor -1 at offset 3
        (40006, 101),
        (40007, 4),
        (40010, 2300),
        (40011, 0xFFFF),
        (40012, 0xFFFF),
    ])
}

#[tokio::test]
async fn sunspec_point_is_located_and_scaled() {
    let bus = sunspec_bus();
    let _conn = attach("fake-sunspec:502", &bus, 0, false);
    let (ctx, _) = recording_context();
    let cfg = yaml(
        "source: sunspec\nuri: fake-sunspec:502\nmodel: 101\noffset: 2\nencoding: uint16\nscalefactor: 3\n",
    );

    let get = ctx.float_getter(&cfg).await.unwrap();
    assert_eq!(get().await.unwrap(), 230.0);

    let set = ctx.float_setter(&cfg, "voltage").await.unwrap();
    set(240.0).await.unwrap();
    assert_eq!(bus.register(40010), Some(2400));

    let missing = yaml("source: sunspec\nuri: fake-sunspec:502\nmodel: 203\noffset: 0\n");
    let get = ctx.float_getter(&missing).await.unwrap();
    assert!(matches!(get().await, Err(HeliosError::NotFound { .. })));
}
