//! Integration tests for the complete broker
//!
//! These tests drive real threads against simulated register banks:
//! - Mutual exclusion and first-fit reservation
//! - Pipeline narrowing between main and auxiliary cores
//! - All-or-nothing encoder claims
//! - Completion delivery, zombie interrupts and timeouts
//! - Client teardown, cancellation and device detach
//! - Interrupt delivery racing ownership changes and attach

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;
use vpu_broker::probe::{DEC_IRQ, DEC_STATUS_REG};
use vpu_broker::sim::{SimBus, SimCore};
use vpu_broker::*;

const BLOCKED: Duration = Duration::from_millis(50);

fn config() -> BrokerConfig {
    BrokerConfig {
        settle_delay_us: 0,
        ..BrokerConfig::default()
    }
}

fn node(kind: CoreKind, base: u64, irq: u32) -> NodeDescriptor {
    NodeDescriptor {
        kind,
        base,
        size: 0x800,
        irqs: vec![irq],
        power: PowerLines::default(),
        cache: None,
    }
}

/// Attach one device built from `(base, bank, node)` triples
fn setup(
    config: BrokerConfig,
    power: Arc<dyn PowerControl>,
    cores: Vec<(Arc<sim::SimRegisters>, NodeDescriptor)>,
) -> (Context, Arc<SimBus>, Arc<Device>) {
    let bus = Arc::new(SimBus::new());
    let mut nodes = Vec::new();
    for (bank, node) in cores {
        bus.install(node.base, bank);
        nodes.push(node);
    }
    let ctx = Context::new(config, Arc::clone(&bus) as Arc<dyn RegionMapper>, power);
    let id = ctx
        .attach(&DeviceDescriptor {
            name: "vpu".into(),
            nodes,
        })
        .expect("attach failed");
    let device = ctx.device(id).expect("device missing");
    (ctx, bus, device)
}

fn decoders(cores: Vec<(Generation, Formats, Formats)>) -> Vec<(Arc<sim::SimRegisters>, NodeDescriptor)> {
    cores
        .into_iter()
        .enumerate()
        .map(|(i, (generation, formats, pipeline))| {
            let bank = SimCore::decoder(generation)
                .formats(formats)
                .pipeline(pipeline)
                .build();
            (bank, node(CoreKind::Decoder, 0x10_0000 * (i as u64 + 1), 40))
        })
        .collect()
}

/// Reservations of the only matching core never overlap
#[test]
fn test_mutual_exclusion() {
    let (ctx, _bus, device) = setup(
        config(),
        Arc::new(NoPowerControl),
        decoders(vec![(Generation::G1, Formats::H264, Formats::empty())]),
    );
    let in_use = AtomicUsize::new(0);
    let done = AtomicUsize::new(0);

    crossbeam::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|_| {
                let client = ctx.open();
                let core = device
                    .reserve(&client, CoreKind::Decoder, CodecFormat::H264)
                    .expect("reserve failed");
                assert_eq!(in_use.fetch_add(1, Ordering::SeqCst), 0);
                std::thread::sleep(Duration::from_millis(1));
                assert_eq!(in_use.fetch_sub(1, Ordering::SeqCst), 1);
                device.release(client.id(), core).expect("release failed");
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
    })
    .expect("thread panicked");

    assert_eq!(done.load(Ordering::SeqCst), 8);
    assert_eq!(device.decoders().free_count(), 1);
}

/// Two decoders, {H264} and {H264, VP9}: first fit and wake on release
#[test]
fn test_first_fit_and_blocked_reservation() {
    let (ctx, _bus, device) = setup(
        config(),
        Arc::new(NoPowerControl),
        decoders(vec![
            (Generation::G1, Formats::H264, Formats::empty()),
            (Generation::Vc8000d, Formats::H264 | Formats::VP9, Formats::empty()),
        ]),
    );
    let (a, b, c) = (ctx.open(), ctx.open(), ctx.open());

    let vp9 = device.reserve(&a, CoreKind::Decoder, CodecFormat::Vp9).unwrap();
    assert_eq!(vp9.index, 1);
    let h264 = device.reserve(&b, CoreKind::Decoder, CodecFormat::H264).unwrap();
    assert_eq!(h264.index, 0);

    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            tx.send(device.reserve(&c, CoreKind::Decoder, CodecFormat::Vp9))
                .unwrap();
        });

        assert!(rx.recv_timeout(BLOCKED).is_err(), "C must block while A holds core1");
        device.release(a.id(), vp9).unwrap();

        let got = rx.recv().unwrap().unwrap();
        assert_eq!(got.index, 1);
    })
    .unwrap();

    assert_eq!(device.decoders().owner(1), Some(c.id()));
}

/// Main core for a format the aux lacks empties the aux mask until release
#[test]
fn test_narrowing_round_trip() {
    let (ctx, _bus, device) = setup(
        config(),
        Arc::new(NoPowerControl),
        decoders(vec![(
            Generation::Vc8000d,
            Formats::H264 | Formats::JPEG | Formats::VP9,
            Formats::H264 | Formats::JPEG,
        )]),
    );
    let decoders = device.decoders();
    let backup = Formats::H264 | Formats::JPEG;
    assert_eq!(decoders.len(), 2);
    assert_eq!(decoders.current_formats(1), Some(backup));

    let client = ctx.open();
    let main = device.reserve(&client, CoreKind::Decoder, CodecFormat::Vp9).unwrap();
    assert_eq!(main.index, 0);
    assert_eq!(decoders.current_formats(1), Some(Formats::empty()));

    device.release(client.id(), main).unwrap();
    assert_eq!(decoders.current_formats(1), Some(backup));

    // A rejected second release leaves the restored mask alone
    assert!(matches!(
        device.release(client.id(), main),
        Err(BrokerError::BogusRelease { .. })
    ));
    assert_eq!(decoders.current_formats(1), Some(backup));
}

/// Main holding H264 keeps the aux from serving JPEG, but not H264
#[test]
fn test_aux_restricted_to_main_format() {
    let (ctx, _bus, device) = setup(
        config(),
        Arc::new(NoPowerControl),
        decoders(vec![(
            Generation::Vc8000d,
            Formats::H264 | Formats::JPEG,
            Formats::H264 | Formats::JPEG,
        )]),
    );
    let (a, b) = (ctx.open(), ctx.open());

    let main = device.reserve(&a, CoreKind::Decoder, CodecFormat::H264).unwrap();
    assert_eq!(main.index, 0);
    assert_eq!(device.decoders().current_formats(1), Some(Formats::H264));

    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            tx.send(device.reserve(&b, CoreKind::Decoder, CodecFormat::Jpeg))
                .unwrap();
        });
        assert!(rx.recv_timeout(BLOCKED).is_err());
        ctx.interrupt(&b);
        assert!(matches!(rx.recv().unwrap(), Err(BrokerError::Interrupted)));
    })
    .unwrap();
    assert_eq!(device.decoders().owner(1), None);

    let aux = device.reserve(&b, CoreKind::Decoder, CodecFormat::H264).unwrap();
    assert_eq!(aux.index, 1);

    // Main released while the aux is held: the aux keeps serving, the
    // main stays narrowed until the aux is back
    device.release(a.id(), main).unwrap();
    assert_eq!(device.decoders().current_formats(0), Some(Formats::H264));
    device.release(b.id(), aux).unwrap();
    assert_eq!(
        device.decoders().current_formats(0),
        Some(Formats::H264 | Formats::JPEG)
    );
}

fn encoders(count: usize) -> Vec<(Arc<sim::SimRegisters>, NodeDescriptor)> {
    (0..count)
        .map(|i| {
            let bank = SimCore::encoder(Generation::Vc8000e)
                .formats(Formats::HEVC | Formats::H264)
                .build();
            (bank, node(CoreKind::Encoder, 0x20_0000 + 0x1_0000 * i as u64, 50))
        })
        .collect()
}

/// A two-core claim never succeeds holding fewer than two cores
#[test]
fn test_all_or_nothing_encoder_claim() {
    let (ctx, _bus, device) = setup(config(), Arc::new(NoPowerControl), encoders(3));
    let (a, b) = (ctx.open(), ctx.open());

    let held = device
        .reserve_encoders(&a, EncoderRequest::new(CoreSet::from_bits(0b010), 1))
        .unwrap();
    assert_eq!(held.bits(), 0b010);

    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            let request = EncoderRequest::new(CoreSet::from_bits(0b011), 2);
            tx.send(device.reserve_encoders(&b, request)).unwrap();
        });

        assert!(rx.recv_timeout(BLOCKED).is_err(), "claim must not return partially");
        device.release_encoders(a.id(), held).unwrap();

        let set = rx.recv().unwrap().unwrap();
        assert_eq!(set.bits(), 0b011);
    })
    .unwrap();

    assert_eq!(device.encoders().owner(0), Some(b.id()));
    assert_eq!(device.encoders().owner(1), Some(b.id()));
    assert_eq!(device.encoders().owner(2), None);

    let too_many = device.reserve_encoders(&a, EncoderRequest::new(CoreSet::from_bits(0b011), 3));
    assert!(matches!(too_many, Err(BrokerError::InvalidRequest(_))));
}

/// Cancelling a blocked multi-core claim leaves its partial claim held
#[test]
fn test_interrupted_encoder_claim_keeps_partial_cores() {
    let (ctx, _bus, device) = setup(config(), Arc::new(NoPowerControl), encoders(2));
    let (a, b) = (ctx.open(), ctx.open());
    let held = device
        .reserve_encoders(&a, EncoderRequest::new(CoreSet::from_bits(0b10), 1))
        .unwrap();

    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            let request = EncoderRequest::new(CoreSet::from_bits(0b11), 2);
            tx.send(device.reserve_encoders(&b, request)).unwrap();
        });

        assert!(rx.recv_timeout(BLOCKED).is_err());
        assert_eq!(device.encoders().owner(0), Some(b.id()));
        ctx.interrupt(&b);
        assert!(matches!(rx.recv().unwrap(), Err(BrokerError::Interrupted)));
    })
    .unwrap();

    assert_eq!(device.encoders().owner(0), Some(b.id()));
    assert_eq!(device.encoders().owner(1), Some(a.id()));

    // Teardown frees what the interrupted claim kept
    assert_eq!(ctx.close(&b), 1);
    assert_eq!(device.encoders().owner(0), None);
    device.release_encoders(a.id(), held).unwrap();
    assert_eq!(device.encoders().free_count(), 2);
}

/// A core dropped from a pending claim is claimed again; success means the
/// full count is held
#[test]
fn test_encoder_claim_reclaims_dropped_core() {
    let (ctx, _bus, device) = setup(config(), Arc::new(NoPowerControl), encoders(3));
    let (a, b) = (ctx.open(), ctx.open());
    device
        .reserve_encoders(&a, EncoderRequest::new(CoreSet::from_bits(0b110), 2))
        .unwrap();

    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            let request = EncoderRequest::new(CoreSet::from_bits(0b111), 2);
            tx.send(device.reserve_encoders(&b, request)).unwrap();
        });

        assert!(rx.recv_timeout(BLOCKED).is_err());
        assert_eq!(device.encoders().owner(0), Some(b.id()));

        // Core 0 is given back behind the claim's back
        device
            .release_encoders(b.id(), CoreSet::from_bits(0b001))
            .unwrap();
        let reclaimed = (0..500).any(|_| {
            std::thread::sleep(Duration::from_millis(1));
            device.encoders().owner(0) == Some(b.id())
        });
        assert!(reclaimed, "claim did not pick core 0 up again");
        assert!(rx.try_recv().is_err(), "claim returned with one core");

        device
            .release_encoders(a.id(), CoreSet::from_bits(0b100))
            .unwrap();
        let set = rx.recv().unwrap().unwrap();
        assert_eq!(set.bits(), 0b101);
    })
    .unwrap();

    assert_eq!(device.encoders().owner(0), Some(b.id()));
    assert_eq!(device.encoders().owner(1), Some(a.id()));
    assert_eq!(device.encoders().owner(2), Some(b.id()));
    assert_eq!(device.encoders().free_count(), 0);
}

/// A completion reaches the blocked owner with its status
#[test]
fn test_completion_delivery() {
    let (ctx, bus, device) = setup(
        config(),
        Arc::new(NoPowerControl),
        decoders(vec![(Generation::G1, Formats::H264, Formats::empty())]),
    );
    let bank = bus.bank(0x10_0000).unwrap();
    let client = ctx.open();
    let core = device.reserve(&client, CoreKind::Decoder, CodecFormat::H264).unwrap();

    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            tx.send(device.wait_ready(&client, core, Some(Duration::from_secs(5))))
                .unwrap();
        });

        bank.raise(DEC_STATUS_REG, DEC_IRQ);
        let outcome = ctx.dispatch_irq(40);
        assert_eq!(outcome, IrqOutcome { delivered: 1, zombies: 0 });

        let status = rx.recv().unwrap().unwrap();
        assert_eq!(status & DEC_IRQ, DEC_IRQ);
    })
    .unwrap();

    assert_eq!(bank.get(DEC_STATUS_REG) & DEC_IRQ, 0);
    let status = device.status();
    assert_eq!(status.irq_received, 1);
    assert_eq!(status.irq_delivered, 1);
}

/// Interrupt on a free core is cleared and wakes nobody
#[test]
fn test_zombie_interrupt() {
    let (ctx, bus, device) = setup(
        config(),
        Arc::new(NoPowerControl),
        decoders(vec![(Generation::G1, Formats::H264, Formats::empty())]),
    );
    let bank = bus.bank(0x10_0000).unwrap();

    bank.raise(DEC_STATUS_REG, DEC_IRQ);
    let outcome = ctx.dispatch_irq(40);
    assert_eq!(outcome, IrqOutcome { delivered: 0, zombies: 1 });
    assert_eq!(bank.get(DEC_STATUS_REG) & DEC_IRQ, 0);

    // Nothing pending carries over to the next owner
    let client = ctx.open();
    let core = device.reserve(&client, CoreKind::Decoder, CodecFormat::H264).unwrap();
    let result = device.wait_ready(&client, core, Some(Duration::from_millis(5)));
    assert!(matches!(result, Err(BrokerError::Timeout { .. })));
}

/// Timeout is sticky, leaves ownership alone and is cleared on request
#[test]
fn test_wait_timeout_sets_flag() {
    let (ctx, _bus, device) = setup(
        config(),
        Arc::new(NoPowerControl),
        decoders(vec![(Generation::G1, Formats::H264, Formats::empty())]),
    );
    let client = ctx.open();
    let core = device.reserve(&client, CoreKind::Decoder, CodecFormat::H264).unwrap();

    assert!(!device.timed_out());
    let err = device.wait_ready(&client, core, None).unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { .. }));
    assert_eq!(err.as_errno(), -16);
    assert!(device.timed_out());
    assert_eq!(device.decoders().owner(0), Some(client.id()));

    device.abort(core).unwrap();
    device.clear_timeout();
    assert!(!device.timed_out());
}

/// A waiter whose core is torn down stops waiting without a timeout
#[test]
fn test_wait_ends_when_core_is_torn_down() {
    let (ctx, _bus, device) = setup(
        config(),
        Arc::new(NoPowerControl),
        decoders(vec![(Generation::G1, Formats::H264, Formats::empty())]),
    );
    let client = ctx.open();
    let core = device.reserve(&client, CoreKind::Decoder, CodecFormat::H264).unwrap();

    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            tx.send(device.wait_ready(&client, core, Some(Duration::from_secs(5))))
                .unwrap();
        });

        assert!(rx.recv_timeout(BLOCKED).is_err());
        assert_eq!(ctx.close(&client), 1);
        let result = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("waiter slept through the teardown");
        assert!(matches!(result, Err(BrokerError::InvalidRequest(_))));
    })
    .unwrap();

    assert!(!device.timed_out());
}

/// A dead client's cores go to the next caller and are powered down
#[test]
fn test_force_release_on_client_death() {
    let power = Arc::new(RecordingPowerControl::new());
    let mut cores = decoders(vec![(Generation::G1, Formats::H264, Formats::empty())]);
    cores[0].1.power = PowerLines {
        clock: Some(3),
        reset: Some(7),
        reset_count: 1,
        power_domain: None,
    };
    let (ctx, _bus, device) = setup(config(), Arc::clone(&power) as Arc<dyn PowerControl>, cores);

    // Idle after attach
    assert_eq!(
        power.drain(),
        vec![
            PowerEvent::Reset { index: 7, deassert: false },
            PowerEvent::Clock { index: 3, on: false },
        ]
    );

    let dead = ctx.open();
    let core = device.reserve(&dead, CoreKind::Decoder, CodecFormat::H264).unwrap();
    assert!(device.core(core).unwrap().is_powered());
    assert_eq!(
        power.drain(),
        vec![
            PowerEvent::Clock { index: 3, on: true },
            PowerEvent::Reset { index: 7, deassert: true },
        ]
    );

    assert_eq!(ctx.close(&dead), 1);
    assert!(!device.core(core).unwrap().is_powered());
    assert_eq!(power.drain().len(), 2);

    let next = ctx.open();
    assert_eq!(
        device.reserve(&next, CoreKind::Decoder, CodecFormat::H264).unwrap(),
        core
    );
    assert_eq!(device.core(core).unwrap().perf().reservations(), 1);
}

/// Formats nobody supports fail fast unless configured to block
#[test]
fn test_unsupported_format() {
    let (ctx, _bus, device) = setup(
        config(),
        Arc::new(NoPowerControl),
        decoders(vec![(Generation::G1, Formats::H264, Formats::empty())]),
    );
    let client = ctx.open();
    let result = device.reserve(&client, CoreKind::Decoder, CodecFormat::Hevc);
    assert!(matches!(result, Err(BrokerError::Unsupported { format: CodecFormat::Hevc })));
    assert_eq!(result.unwrap_err().as_errno(), -95);

    let blocking = BrokerConfig {
        reject_unsupported: false,
        ..config()
    };
    let (ctx, _bus, device) = setup(
        blocking,
        Arc::new(NoPowerControl),
        decoders(vec![(Generation::G1, Formats::H264, Formats::empty())]),
    );
    let client = ctx.open();
    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            tx.send(device.reserve(&client, CoreKind::Decoder, CodecFormat::Hevc))
                .unwrap();
        });
        assert!(rx.recv_timeout(BLOCKED).is_err());
        ctx.interrupt(&client);
        assert!(matches!(rx.recv().unwrap(), Err(BrokerError::Interrupted)));
    })
    .unwrap();
}

/// Detach fails blocked callers with DeviceNotFound
#[test]
fn test_detach_wakes_blocked_callers() {
    let (ctx, bus, device) = setup(
        config(),
        Arc::new(NoPowerControl),
        decoders(vec![(Generation::G1, Formats::H264, Formats::empty())]),
    );
    let (a, b) = (ctx.open(), ctx.open());
    device.reserve(&a, CoreKind::Decoder, CodecFormat::H264).unwrap();

    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            tx.send(device.reserve(&b, CoreKind::Decoder, CodecFormat::H264))
                .unwrap();
        });
        assert!(rx.recv_timeout(BLOCKED).is_err());
        ctx.detach(device.id()).unwrap();
        assert!(matches!(
            rx.recv().unwrap(),
            Err(BrokerError::DeviceNotFound { .. })
        ));
    })
    .unwrap();

    assert_eq!(bus.mapped(), 0);
    assert!(!ctx.irqs().is_registered(40));
}

/// Post-processor ownership is separate from core ownership
#[test]
fn test_post_processor_reservation() {
    let (ctx, _bus, device) = setup(
        config(),
        Arc::new(NoPowerControl),
        decoders(vec![(Generation::G1, Formats::H264 | Formats::PP, Formats::empty())]),
    );
    let (a, b) = (ctx.open(), ctx.open());

    device.reserve_post_processor(&a).unwrap();
    assert!(matches!(
        device.release_post_processor(b.id()),
        Err(BrokerError::BogusRelease { .. })
    ));

    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            tx.send(device.reserve_post_processor(&b)).unwrap();
        });
        assert!(rx.recv_timeout(BLOCKED).is_err());
        device.release_post_processor(a.id()).unwrap();
        rx.recv().unwrap().unwrap();
    })
    .unwrap();
    assert_eq!(device.decoders().pp_owner(), Some(b.id()));

    // The decoder core itself is still free
    let core = device.reserve(&a, CoreKind::Decoder, CodecFormat::H264).unwrap();
    assert_eq!(core.index, 0);
}

/// Cache units are matched by binding; invalid directions are skipped
#[test]
fn test_cache_units() {
    let binding = |dir| CacheBinding {
        client: CacheClient::Vc8000d0,
        dir,
        parent: CoreKind::Decoder,
        parent_index: 0,
    };
    let cache_node = |base, dir| NodeDescriptor {
        kind: CoreKind::Cache,
        base,
        size: 0x40,
        irqs: vec![60],
        power: PowerLines::default(),
        cache: Some(binding(dir)),
    };

    let bus = Arc::new(SimBus::new());
    // Cache and shaper
    bus.install(0x30_0000, SimCore::cache(0).build());
    // Cache only
    bus.install(0x31_0000, SimCore::cache(1).build());
    let ctx = Context::new(config(), Arc::clone(&bus) as Arc<dyn RegionMapper>, Arc::new(NoPowerControl));
    let id = ctx
        .attach(&DeviceDescriptor {
            name: "cache".into(),
            nodes: vec![
                cache_node(0x30_0000, CacheDir::Read),
                cache_node(0x30_0000, CacheDir::Write),
                cache_node(0x31_0000, CacheDir::Write),
            ],
        })
        .unwrap();
    let device = ctx.device(id).unwrap();

    let caches = device.caches();
    assert_eq!(caches.len(), 2);
    assert_eq!(caches.cores()[0].base(), 0x30_0080);
    assert_eq!(caches.cores()[1].base(), 0x30_0200);

    let client = ctx.open();
    let write = device.reserve_cache(&client, binding(CacheDir::Write)).unwrap();
    assert_eq!(write.index, 1);
    assert_eq!(device.asic_id(write).unwrap(), 0x0000_0100);

    let other = CacheBinding {
        client: CacheClient::Vc8000e,
        ..binding(CacheDir::Read)
    };
    assert!(matches!(
        device.reserve_cache(&client, other),
        Err(BrokerError::InvalidRequest(_))
    ));

    assert_eq!(ctx.close(&client), 1);
    assert_eq!(caches.owner(1), None);
}

/// Parks the first status write-back after arming until resumed
struct StatusGate {
    armed: AtomicBool,
    parked: channel::Sender<()>,
    resume: channel::Receiver<()>,
}

struct GatedWindow {
    inner: Arc<dyn RegisterIo>,
    gate: Arc<StatusGate>,
}

impl RegisterIo for GatedWindow {
    fn read32(&self, offset: usize) -> u32 {
        self.inner.read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.inner.write32(offset, value);
        if offset == DEC_STATUS_REG && self.gate.armed.swap(false, Ordering::SeqCst) {
            self.gate.parked.send(()).unwrap();
            self.gate.resume.recv().unwrap();
        }
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

struct GatedBus {
    bus: Arc<SimBus>,
    gate: Arc<StatusGate>,
}

impl RegionMapper for GatedBus {
    fn map(&self, base: u64, size: usize) -> Result<Arc<dyn RegisterIo>> {
        let inner = self.bus.map(base, size)?;
        Ok(Arc::new(GatedWindow {
            inner,
            gate: Arc::clone(&self.gate),
        }))
    }

    fn unmap(&self, base: u64, size: usize) {
        self.bus.unmap(base, size);
    }
}

/// A completion acked for one owner never reaches the next one
#[test]
fn test_completion_not_handed_to_next_owner() {
    let bus = Arc::new(SimBus::new());
    let bank = SimCore::decoder(Generation::G1).formats(Formats::H264).build();
    bus.install(0x10_0000, Arc::clone(&bank));
    let (parked_tx, parked_rx) = channel::bounded(1);
    let (resume_tx, resume_rx) = channel::bounded(1);
    let gate = Arc::new(StatusGate {
        armed: AtomicBool::new(false),
        parked: parked_tx,
        resume: resume_rx,
    });
    let mapper = Arc::new(GatedBus {
        bus,
        gate: Arc::clone(&gate),
    });
    let ctx = Context::new(config(), mapper as Arc<dyn RegionMapper>, Arc::new(NoPowerControl));
    let id = ctx
        .attach(&DeviceDescriptor {
            name: "vpu".into(),
            nodes: vec![node(CoreKind::Decoder, 0x10_0000, 40)],
        })
        .unwrap();
    let device = ctx.device(id).unwrap();
    let (a, b) = (ctx.open(), ctx.open());
    let core = device.reserve(&a, CoreKind::Decoder, CodecFormat::H264).unwrap();

    bank.raise(DEC_STATUS_REG, DEC_IRQ);
    gate.armed.store(true, Ordering::SeqCst);

    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        let handler = s.spawn(|_| ctx.dispatch_irq(40));
        parked_rx.recv().unwrap();

        // A hands the core to B while the handler sits right after the clear
        s.spawn(|_| {
            device.release(a.id(), core).unwrap();
            tx.send(device.reserve(&b, CoreKind::Decoder, CodecFormat::H264))
                .unwrap();
        });
        let handed_over = rx.recv_timeout(BLOCKED);
        resume_tx.send(()).unwrap();
        assert!(handed_over.is_err(), "ownership changed between ack and record");

        assert_eq!(
            handler.join().unwrap(),
            IrqOutcome { delivered: 1, zombies: 0 }
        );
        assert_eq!(rx.recv().unwrap().unwrap(), core);
    })
    .unwrap();

    let stale = device.wait_ready(&b, core, Some(BLOCKED));
    assert!(matches!(stale, Err(BrokerError::Timeout { .. })));
}

/// Holds the power-down of one clock line until resumed
struct StallingPower {
    clock: usize,
    entered: channel::Sender<()>,
    resume: channel::Receiver<()>,
}

impl PowerControl for StallingPower {
    fn clock_enable(&self, index: usize, on: bool) {
        if index == self.clock && !on {
            self.entered.send(()).unwrap();
            self.resume.recv().unwrap();
        }
    }

    fn reset(&self, _index: usize, _deassert: bool) {}

    fn power_domain(&self, _index: usize, _on: bool) {}

    fn set_clock_rate(&self, _index: usize, _hz: u64) {}
}

/// Interrupts of an attached device are delivered while another attaches
#[test]
fn test_attach_does_not_stall_interrupts() {
    let bus = Arc::new(SimBus::new());
    let bank = SimCore::decoder(Generation::G1).formats(Formats::H264).build();
    bus.install(0x10_0000, Arc::clone(&bank));
    bus.install(0x20_0000, SimCore::decoder(Generation::G1).formats(Formats::H264).build());
    let (entered_tx, entered_rx) = channel::bounded(1);
    let (resume_tx, resume_rx) = channel::bounded(1);
    let power = Arc::new(StallingPower {
        clock: 9,
        entered: entered_tx,
        resume: resume_rx,
    });
    let ctx = Context::new(config(), Arc::clone(&bus) as Arc<dyn RegionMapper>, power);

    let first = ctx
        .attach(&DeviceDescriptor {
            name: "a".into(),
            nodes: vec![node(CoreKind::Decoder, 0x10_0000, 40)],
        })
        .unwrap();
    let device = ctx.device(first).unwrap();
    let client = ctx.open();
    let core = device.reserve(&client, CoreKind::Decoder, CodecFormat::H264).unwrap();

    let mut gated = node(CoreKind::Decoder, 0x20_0000, 41);
    gated.power.clock = Some(9);
    let second = DeviceDescriptor {
        name: "b".into(),
        nodes: vec![gated],
    };

    let (tx, rx) = channel::unbounded();
    crossbeam::thread::scope(|s| {
        let attach = s.spawn(|_| ctx.attach(&second));
        entered_rx.recv().unwrap();

        s.spawn(|_| {
            bank.raise(DEC_STATUS_REG, DEC_IRQ);
            tx.send(ctx.dispatch_irq(40)).unwrap();
        });
        let outcome = rx.recv_timeout(Duration::from_secs(5));
        // The half-attached device is not reachable yet
        let pending = ctx.device(DeviceId(1));
        resume_tx.send(()).unwrap();

        assert_eq!(outcome.expect("dispatch waited on the attach").delivered, 1);
        assert!(matches!(pending, Err(BrokerError::DeviceNotFound { .. })));
        assert_eq!(attach.join().unwrap().unwrap(), DeviceId(1));
    })
    .unwrap();

    assert_eq!(device.wait_ready(&client, core, None).unwrap() & DEC_IRQ, DEC_IRQ);
    assert_eq!(ctx.device_count(), 2);
}
