mod common;

use std::sync::{Arc, Mutex};

use axerrno::AxResult;
use capaddrspace::{AccessOutcome, AccessWidth, GuestRegion, MappingFlags, MmioAccess, MmioDevice, Stage2Mapper};
use capvirtio::consts::*;
use capvirtio::{DeviceContext, VirtioBackend, VirtioMmio};
use common::*;

/// A backend with two queues that records what the transport asks of it.
#[derive(Default)]
struct Probe {
    kicks: Arc<Mutex<Vec<usize>>>,
    resets: Arc<Mutex<usize>>,
}

impl VirtioBackend for Probe {
    fn device_id(&self) -> u32 {
        0x2a
    }

    fn queue_max(&self) -> &[u16] {
        &[16, 8]
    }

    fn host_features(&self) -> u64 {
        (1 << 33) | 0b101
    }

    fn kick(&mut self, _ctx: &mut DeviceContext<'_>, queue: usize) -> AxResult {
        self.kicks.lock().unwrap().push(queue);
        Ok(())
    }

    fn reset(&mut self) {
        *self.resets.lock().unwrap() += 1;
    }
}

struct NoStage2;

impl Stage2Mapper for NoStage2 {
    fn map_identity(&self, _page: usize, _flags: MappingFlags) -> AxResult {
        panic!("virtio registers are never mapped");
    }
}

fn probe() -> (VirtioMmio<Probe>, Driver, Arc<Mutex<Vec<usize>>>, Arc<Mutex<usize>>) {
    init_logger();
    let mem = guest_ram();
    let vgic = Arc::new(RecordingVgic::default());
    let backend = Probe::default();
    let kicks = backend.kicks.clone();
    let resets = backend.resets.clone();
    let dev = VirtioMmio::new("probe", mem.clone(), irq_line(&vgic, 40), backend);
    (dev, Driver::new(mem), kicks, resets)
}

#[test]
fn identity_registers() {
    let (dev, driver, _, _) = probe();
    assert_eq!(driver.read(&dev, MAGIC_VALUE), 0x7472_6976);
    assert_eq!(driver.read(&dev, VERSION), 1);
    assert_eq!(driver.read(&dev, DEVICE_ID), 0x2a);
    assert_eq!(driver.read(&dev, VENDOR_ID), VIRTIO_VENDOR_ID);
}

#[test]
fn feature_windows() {
    let (dev, driver, _, _) = probe();
    assert_eq!(driver.read(&dev, HOST_FEATURES), 0b101);
    driver.write(&dev, HOST_FEATURES_SEL, 1);
    assert_eq!(driver.read(&dev, HOST_FEATURES), 0b10);
    driver.write(&dev, HOST_FEATURES_SEL, 2);
    assert_eq!(driver.read(&dev, HOST_FEATURES), 0);

    driver.write(&dev, GUEST_FEATURES, 0b100);
    driver.write(&dev, GUEST_FEATURES_SEL, 1);
    driver.write(&dev, GUEST_FEATURES, 0b10);
    assert_eq!(dev.guest_features(), (1 << 33) | 0b100);
}

#[test]
fn queue_setup_and_notify() {
    let (dev, mut driver, kicks, _) = probe();
    driver.init(&dev, 0, 2, 8);
    assert!(dev.queue_ready(0));
    assert!(dev.queue_ready(1));
    assert!(dev.status().contains(DeviceStatus::DRIVER_OK));

    driver.write(&dev, QUEUE_SEL, 0);
    assert_eq!(driver.read(&dev, QUEUE_NUM_MAX), 16);
    assert_eq!(
        driver.read(&dev, QUEUE_PFN) as usize,
        (RAM_BASE + 0x1_0000) / PAGE
    );

    driver.write(&dev, QUEUE_NOTIFY, 1);
    driver.write(&dev, QUEUE_NOTIFY, 0);
    // No such queue.
    driver.write(&dev, QUEUE_NOTIFY, 5);
    assert_eq!(*kicks.lock().unwrap(), vec![1, 0]);

    // A zero pfn tears the ring down and notifies are dropped.
    driver.write(&dev, QUEUE_SEL, 1);
    driver.write(&dev, QUEUE_PFN, 0);
    assert!(!dev.queue_ready(1));
    driver.write(&dev, QUEUE_NOTIFY, 1);
    assert_eq!(kicks.lock().unwrap().len(), 2);
}

#[test]
fn unusable_queue_parameters_leave_the_ring_unset() {
    let (dev, driver, _, _) = probe();
    driver.write(&dev, GUEST_PAGE_SIZE, PAGE as u32);
    driver.write(&dev, QUEUE_SEL, 0);

    // Not a power of two.
    driver.write(&dev, QUEUE_NUM, 12);
    driver.write(&dev, QUEUE_PFN, ((RAM_BASE + 0x1_0000) / PAGE) as u32);
    assert!(!dev.queue_ready(0));

    // Clamped to the maximum, which is usable.
    driver.write(&dev, QUEUE_NUM, 1000);
    driver.write(&dev, QUEUE_PFN, ((RAM_BASE + 0x1_0000) / PAGE) as u32);
    assert!(dev.queue_ready(0));

    // Outside guest RAM.
    driver.write(&dev, QUEUE_PFN, ((RAM_BASE + RAM_SIZE - PAGE) / PAGE) as u32);
    assert!(!dev.queue_ready(0));
    driver.write(&dev, QUEUE_PFN, 0x10);
    assert!(!dev.queue_ready(0));

    // Out of range selection reads as zero and ignores writes.
    driver.write(&dev, QUEUE_SEL, 7);
    assert_eq!(driver.read(&dev, QUEUE_NUM_MAX), 0);
    driver.write(&dev, QUEUE_NUM, 8);
    driver.write(&dev, QUEUE_PFN, ((RAM_BASE + 0x1_0000) / PAGE) as u32);
    assert!(!dev.queue_ready(0));
    assert!(!dev.queue_ready(1));
}

#[test]
fn status_zero_resets_everything() {
    let (dev, mut driver, _, resets) = probe();
    for round in 0..3 {
        driver.init(&dev, 0, 2, 8);
        dev.with_device(|_, ctx| ctx.signal_used()).unwrap();
        driver.write(&dev, GUEST_FEATURES, 1);
        assert!(dev.queue_ready(0) && dev.queue_ready(1));

        driver.write(&dev, STATUS, 0);
        assert!(!dev.queue_ready(0), "round {}", round);
        assert!(!dev.queue_ready(1));
        assert_eq!(driver.read(&dev, STATUS), 0);
        assert_eq!(driver.read(&dev, INTERRUPT_STATUS), 0);
        assert_eq!(dev.guest_features(), 0);
        driver.write(&dev, QUEUE_SEL, 0);
        assert_eq!(driver.read(&dev, QUEUE_PFN), 0);
    }
    // `init` resets once more before each handshake.
    assert_eq!(*resets.lock().unwrap(), 6);
}

#[test]
fn interrupt_status_is_a_bitmask() {
    let (dev, driver, _, _) = probe();
    dev.with_device(|_, ctx| {
        ctx.signal_used()?;
        ctx.signal_config()
    })
    .unwrap();
    assert_eq!(driver.read(&dev, INTERRUPT_STATUS), 0b11);
    driver.write(&dev, INTERRUPT_ACK, 0b01);
    assert_eq!(driver.read(&dev, INTERRUPT_STATUS), 0b10);
    driver.write(&dev, INTERRUPT_ACK, 0b10);
    assert_eq!(driver.read(&dev, INTERRUPT_STATUS), 0);
}

#[test]
fn mmio_accesses_of_the_wrong_shape_are_ignored() {
    let (dev, _, _, _) = probe();
    let region = GuestRegion::new(0x0a00_0000, 0x200).unwrap();
    let read = |offset: usize, width| {
        dev.access(&MmioAccess::read(0x0a00_0000 + offset, width, region), &NoStage2)
            .unwrap()
    };
    assert_eq!(read(MAGIC_VALUE, AccessWidth::Dword), AccessOutcome::Completed(0x7472_6976));
    assert_eq!(read(MAGIC_VALUE, AccessWidth::Byte), AccessOutcome::Completed(0));
    assert_eq!(read(MAGIC_VALUE + 2, AccessWidth::Dword), AccessOutcome::Completed(0));

    let write = MmioAccess::write(0x0a00_0000 + STATUS, AccessWidth::Byte, 7, region);
    assert_eq!(dev.access(&write, &NoStage2), Ok(AccessOutcome::Completed(0)));
    assert_eq!(dev.status(), DeviceStatus::empty());
    let write = MmioAccess::write(0x0a00_0000 + STATUS, AccessWidth::Dword, 7, region);
    dev.access(&write, &NoStage2).unwrap();
    assert_eq!(dev.status().bits(), 7);
}
