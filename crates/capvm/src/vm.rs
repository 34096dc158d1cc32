use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::{ax_err, ax_err_type, AxResult};
use capaddrspace::{GuestMemory, GuestRam, GuestRegion, MmioDevice, MmioRegistry, RamWindow, Stage2Mapper};
use capvcpu::{IrqLine, VCpu, VCpuState, Vgic};
use capvirtio::{HostConsole, NetSwitch, ProxyTransport};
use spin::Mutex;

use crate::config::VmConfig;
use crate::dcc::Dcc;
use crate::devices::{self, DeviceEnv};
use crate::notify::{IrqBridge, NotificationHandler, NotificationTable};
use crate::trap::ExitAction;
use crate::{CapVmHal, GuestPhysAddr, HostEvent, HostIrq, HostPort};

/// Interrupt lines of passthrough devices are routed to the boot vCPU.
const PASSTHROUGH_IRQ_CPU: usize = 0;

/// A Virtual Machine.
pub struct Vm<H: CapVmHal> {
    id: usize,
    name: String,
    entry: GuestPhysAddr,
    boot_arg: usize,
    pub(crate) clock_scale: u64,

    vcpus: Vec<Mutex<VCpu<H::VCpu>>>,
    ports: Vec<Mutex<Option<H::Port>>>,

    pub(crate) registry: MmioRegistry,
    notifications: NotificationTable,
    mem: Arc<dyn GuestMemory>,
    pub(crate) vgic: Arc<dyn Vgic>,
    pub(crate) stage2: Arc<dyn Stage2Mapper>,
    pub(crate) dcc: Dcc,
    _switches: Vec<Arc<NetSwitch>>,

    running: AtomicBool,
}

impl<H: CapVmHal> fmt::Debug for Vm<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("vcpus", &self.vcpus.len())
            .field("regions", &self.registry.len())
            .finish()
    }
}

impl<H: CapVmHal> Vm<H> {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn vcpu_num(&self) -> usize {
        self.vcpus.len()
    }

    pub fn registry(&self) -> &MmioRegistry {
        &self.registry
    }

    pub fn notifications(&self) -> &NotificationTable {
        &self.notifications
    }

    pub fn guest_memory(&self) -> &Arc<dyn GuestMemory> {
        &self.mem
    }

    /// Whether the guest has not powered off yet.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn vcpu_state(&self, vcpu_id: usize) -> Option<VCpuState> {
        self.vcpus.get(vcpu_id).map(|vcpu| vcpu.lock().state())
    }

    pub(crate) fn vcpu(&self, vcpu_id: usize) -> Option<&Mutex<VCpu<H::VCpu>>> {
        self.vcpus.get(vcpu_id)
    }

    /// Starts the boot vCPU at the configured entry point.
    pub fn start_bsp(&self) -> AxResult {
        match self.vcpus.first() {
            Some(bsp) => bsp.lock().start(self.entry, self.boot_arg),
            None => ax_err!(BadState, "VM has no vCPU"),
        }
    }

    /// Starts the boot vCPU and runs its dispatch loop on the calling context.
    ///
    /// Secondary vCPUs are started by the guest through PSCI, their loops are
    /// run by the host with [`Vm::run_vcpu`].
    pub fn boot(&self) -> AxResult {
        info!("VM[{}] {} booting at {:#x}", self.id, self.name, self.entry);
        self.start_bsp()?;
        self.run_vcpu(0)
    }

    /// Runs the dispatch loop of `vcpu_id` until the guest powers off or an
    /// exit is fatal.
    pub fn run_vcpu(&self, vcpu_id: usize) -> AxResult {
        let slot = self
            .ports
            .get(vcpu_id)
            .ok_or_else(|| ax_err_type!(InvalidInput, format!("no vcpu {}", vcpu_id)))?;
        let Some(mut port) = slot.lock().take() else {
            return ax_err!(BadState, format!("vcpu {} loop already running", vcpu_id));
        };
        debug!("VM[{}] vcpu {} loop entered", self.id, vcpu_id);
        let result = self.vcpu_loop(vcpu_id, &mut port);
        *slot.lock() = Some(port);
        debug!("VM[{}] vcpu {} loop left: {:?}", self.id, vcpu_id, result);
        result
    }

    fn vcpu_loop(&self, vcpu_id: usize, port: &mut H::Port) -> AxResult {
        let vcpu = self
            .vcpu(vcpu_id)
            .ok_or_else(|| ax_err_type!(InvalidInput, format!("no vcpu {}", vcpu_id)))?;
        while self.is_running() {
            match port.recv()? {
                HostEvent::Notification { label } => {
                    self.dispatch_notification(label);
                    self.drain_notifications(port)?;
                }
                HostEvent::VirtualPpi { irq } => {
                    let mut vcpu = vcpu.lock();
                    trace!("vcpu {}: virtual ppi {}", vcpu_id, irq);
                    self.vgic.inject(irq, vcpu_id)?;
                    vcpu.ack_vppi(irq)?;
                    self.drain_notifications(port)?;
                    vcpu.resume()?;
                }
                HostEvent::Fault(syndrome) => {
                    let mut vcpu = vcpu.lock();
                    match self.handle_exit(&mut vcpu, port, &syndrome) {
                        Ok(ExitAction::Resume) => {
                            self.drain_notifications(port)?;
                            vcpu.resume()?;
                        }
                        Ok(ExitAction::Halt) => vcpu.halt()?,
                        Ok(ExitAction::Shutdown) => {
                            vcpu.halt()?;
                            drop(vcpu);
                            self.shutdown();
                        }
                        Err(e) => {
                            if let Err(halt_err) = vcpu.halt() {
                                warn!("vcpu {}: halt failed: {:?}", vcpu_id, halt_err);
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }
        vcpu.lock().halt()
    }

    /// Stops the VM. vCPUs busy with an exit halt once they notice.
    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("VM[{}] {} powered off", self.id, self.name);
        for (id, vcpu) in self.vcpus.iter().enumerate() {
            if let Some(mut vcpu) = vcpu.try_lock() {
                if let Err(e) = vcpu.halt() {
                    warn!("vcpu {}: halt failed: {:?}", id, e);
                }
            }
        }
    }

    pub(crate) fn dispatch_notification(&self, label: u64) {
        if let Err(e) = self.notifications.dispatch(label) {
            warn!("VM[{}] notification {} failed: {:?}", self.id, label, e);
        }
    }

    /// Handles every pending notification without blocking.
    pub(crate) fn drain_notifications(&self, port: &mut H::Port) -> AxResult {
        while let Some(label) = port.poll()? {
            self.dispatch_notification(label);
        }
        Ok(())
    }
}

/// Assembles a [`Vm`] from its configuration and the host's capabilities.
pub struct VmBuilder<H: CapVmHal> {
    config: VmConfig,
    vgic: Arc<dyn Vgic>,
    stage2: Arc<dyn Stage2Mapper>,
    console: Arc<dyn HostConsole>,
    mem: Option<Arc<dyn GuestMemory>>,
    vcpus: Vec<(H::VCpu, H::Port)>,
    transports: BTreeMap<String, Arc<dyn ProxyTransport>>,
    devices: Vec<(GuestRegion, Arc<dyn MmioDevice>)>,
    handlers: Vec<(u64, Arc<dyn NotificationHandler>)>,
    passthrough: Vec<(u64, Arc<dyn HostIrq>, u32)>,
}

impl<H: CapVmHal> VmBuilder<H> {
    pub fn new(
        config: VmConfig,
        vgic: Arc<dyn Vgic>,
        stage2: Arc<dyn Stage2Mapper>,
        console: Arc<dyn HostConsole>,
    ) -> Self {
        Self {
            config,
            vgic,
            stage2,
            console,
            mem: None,
            vcpus: Vec::new(),
            transports: BTreeMap::new(),
            devices: Vec::new(),
            handlers: Vec::new(),
            passthrough: Vec::new(),
        }
    }

    /// Uses `mem` as guest RAM instead of a freshly allocated buffer.
    pub fn guest_memory(mut self, mem: Arc<dyn GuestMemory>) -> Self {
        self.mem = Some(mem);
        self
    }

    /// Adds the next vCPU together with the endpoint its exits arrive on.
    pub fn vcpu(mut self, arch_vcpu: H::VCpu, port: H::Port) -> Self {
        self.vcpus.push((arch_vcpu, port));
        self
    }

    /// Makes `transport` available to proxy devices configured with `port`.
    pub fn proxy_transport(mut self, port: impl Into<String>, transport: Arc<dyn ProxyTransport>) -> Self {
        self.transports.insert(port.into(), transport);
        self
    }

    /// Registers a device which is not described by the configuration.
    pub fn device(mut self, region: GuestRegion, device: Arc<dyn MmioDevice>) -> Self {
        self.devices.push((region, device));
        self
    }

    pub fn notification(mut self, label: u64, handler: Arc<dyn NotificationHandler>) -> Self {
        self.handlers.push((label, handler));
        self
    }

    /// Forwards the physical interrupt signalled on `label` to the guest as
    /// `virq`.
    pub fn passthrough_irq(mut self, label: u64, host: Arc<dyn HostIrq>, virq: u32) -> Self {
        self.passthrough.push((label, host, virq));
        self
    }

    pub fn build(self) -> AxResult<Arc<Vm<H>>> {
        let config = self.config;
        config.validate()?;
        if self.vcpus.len() != config.cpu_num {
            return ax_err!(
                InvalidInput,
                format!(
                    "VM[{}] configures {} vcpus, {} given",
                    config.id,
                    config.cpu_num,
                    self.vcpus.len()
                )
            );
        }

        let ram = config.ram_region()?;
        let mem: Arc<dyn GuestMemory> = match self.mem {
            Some(mem) if mem.region() != ram => {
                return ax_err!(
                    InvalidInput,
                    format!("guest memory {} does not match RAM {}", mem.region(), ram)
                );
            }
            Some(mem) => mem,
            None => Arc::new(GuestRam::new(ram)),
        };

        let mut registry = MmioRegistry::new();
        registry.register(ram, Arc::new(RamWindow::new(ram)))?;

        let set = devices::instantiate(
            &config.devices,
            &DeviceEnv {
                mem: &mem,
                vgic: &self.vgic,
                console: &self.console,
                transports: &self.transports,
            },
        )?;
        for (region, device) in set.regions.into_iter().chain(self.devices) {
            registry.register(region, device)?;
        }

        let mut notifications = NotificationTable::new();
        for (label, handler) in set.handlers.into_iter().chain(self.handlers) {
            notifications.register(label, handler)?;
        }
        for (label, host, virq) in self.passthrough {
            let bridge = IrqBridge::new(host, IrqLine::new(self.vgic.clone(), virq, PASSTHROUGH_IRQ_CPU));
            self.vgic.set_eoi_handler(virq, bridge.eoi_handler())?;
            notifications.register(label, Arc::new(bridge))?;
        }

        let mut vcpus = Vec::with_capacity(self.vcpus.len());
        let mut ports = Vec::with_capacity(self.vcpus.len());
        for (vcpu_id, (arch_vcpu, port)) in self.vcpus.into_iter().enumerate() {
            vcpus.push(Mutex::new(VCpu::new(vcpu_id, arch_vcpu)));
            ports.push(Mutex::new(Some(port)));
        }

        info!(
            "VM[{}] {} created: {} vcpus, {} regions, {} notification labels",
            config.id,
            config.name,
            vcpus.len(),
            registry.len(),
            notifications.len()
        );

        Ok(Arc::new(Vm {
            id: config.id,
            name: config.name,
            entry: config.entry_point,
            boot_arg: config.dtb_addr,
            clock_scale: config.clock_scale,
            vcpus,
            ports,
            registry,
            notifications,
            mem,
            vgic: self.vgic,
            stage2: self.stage2,
            dcc: Dcc::new(self.console),
            _switches: set.switches,
            running: AtomicBool::new(true),
        }))
    }
}
