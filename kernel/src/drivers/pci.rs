//! PCI driver registration
//!
//! Bus enumeration itself is a driver concern; the kernel keeps the
//! function list and the driver match table. A platform module reports
//! discovered functions with [`add_device`]; driver modules register a
//! [`PciDriver`] with an id table and get probed against every function,
//! present and future.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

/// PCI class/vendor identity of one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub segment: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub address: PciAddress,
    pub vendor: u16,
    pub device: u16,
    pub class: u8,
    pub sub_class: u8,
    pub prog_if: u8,
}

/// Entry of a driver's match table. `ANY` wildcards a field.
#[derive(Debug, Clone, Copy)]
pub struct PciVariant {
    pub vendor: u16,
    pub device: u16,
    pub class: u16,
    pub sub_class: u16,
}

impl PciVariant {
    pub const ANY: u16 = 0xFFFF;

    pub const fn id(vendor: u16, device: u16) -> Self {
        Self {
            vendor,
            device,
            class: Self::ANY,
            sub_class: Self::ANY,
        }
    }

    pub const fn class(class: u16, sub_class: u16) -> Self {
        Self {
            vendor: Self::ANY,
            device: Self::ANY,
            class,
            sub_class,
        }
    }

    fn matches(&self, dev: &PciDevice) -> bool {
        (self.vendor == Self::ANY || self.vendor == dev.vendor)
            && (self.device == Self::ANY || self.device == dev.device)
            && (self.class == Self::ANY || self.class == dev.class as u16)
            && (self.sub_class == Self::ANY || self.sub_class == dev.sub_class as u16)
    }
}

/// What a PCI driver provides to the bus.
pub trait PciDriver: Send + Sync {
    fn name(&self) -> &'static str;
    fn variants(&self) -> &[PciVariant];
    /// Claim a matching function. Nonzero means the driver passed.
    fn probe(&self, device: &PciDevice) -> i32;
    fn remove(&self, _device: &PciDevice) {}
}

struct Registry {
    devices: Vec<PciDevice>,
    drivers: Vec<Arc<dyn PciDriver>>,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    devices: Vec::new(),
    drivers: Vec::new(),
});

pub fn init() {
    log::debug!("pci: registration interface ready");
}

/// Report a discovered function. Probes already-registered drivers.
pub fn add_device(device: PciDevice) {
    let drivers: Vec<Arc<dyn PciDriver>> = {
        let mut registry = REGISTRY.lock();
        registry.devices.push(device);
        registry.drivers.clone()
    };
    for driver in drivers {
        try_probe(&driver, &device);
    }
}

/// Register a driver. Probes all known functions.
pub fn register_driver(driver: Arc<dyn PciDriver>) {
    let devices: Vec<PciDevice> = {
        let mut registry = REGISTRY.lock();
        registry.drivers.push(driver.clone());
        registry.devices.clone()
    };
    log::info!("pci: registered driver \"{}\"", driver.name());
    for device in devices {
        try_probe(&driver, &device);
    }
}

fn try_probe(driver: &Arc<dyn PciDriver>, device: &PciDevice) {
    if driver.variants().iter().any(|v| v.matches(device)) {
        let status = driver.probe(device);
        if status != 0 {
            log::warn!(
                "pci: driver \"{}\" declined {:04x}:{:04x} ({})",
                driver.name(),
                device.vendor,
                device.device,
                status
            );
        }
    }
}

/// Snapshot of known functions.
pub fn devices() -> Vec<PciDevice> {
    REGISTRY.lock().devices.clone()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDriver {
        probes: AtomicUsize,
    }

    impl PciDriver for CountingDriver {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn variants(&self) -> &[PciVariant] {
            const VARIANTS: [PciVariant; 1] = [PciVariant::id(0x1AF4, 0x1000)];
            &VARIANTS
        }
        fn probe(&self, _device: &PciDevice) -> i32 {
            self.probes.fetch_add(1, Ordering::Relaxed);
            0
        }
    }

    fn device(vendor: u16, dev: u16) -> PciDevice {
        PciDevice {
            address: PciAddress {
                segment: 0,
                bus: 0,
                slot: 1,
                function: 0,
            },
            vendor,
            device: dev,
            class: 2,
            sub_class: 0,
            prog_if: 0,
        }
    }

    #[test]
    fn driver_probes_matching_devices_only() {
        let driver = Arc::new(CountingDriver {
            probes: AtomicUsize::new(0),
        });
        add_device(device(0x1AF4, 0x1000)); // virtio-net: matches
        add_device(device(0x8086, 0x100E)); // e1000: no match
        register_driver(driver.clone());
        assert_eq!(driver.probes.load(Ordering::Relaxed), 1);

        // A late-arriving matching device is probed too.
        add_device(device(0x1AF4, 0x1000));
        assert_eq!(driver.probes.load(Ordering::Relaxed), 2);
    }
}
