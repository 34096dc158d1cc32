#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axerrno::{AxError, AxResult};
use capaddrspace::{MappingFlags, Stage2Mapper};
use capvcpu::{ArchVCpu, ContextFrame, EoiHandler, ExitSyndrome, Vgic, VirtualTimer};
use capvirtio::HostConsole;
use capvm::{CapVmHal, HostEvent, HostIrq, HostPort, VmBuilder, VmConfig};

pub const RAM_BASE: usize = 0x4000_0000;
pub const ENTRY: usize = 0x4008_0000;
pub const DTB: usize = 0x400f_0000;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A VM with `cpus` vCPUs, 1 MiB of RAM at `RAM_BASE` and 50 ticks per µs,
/// followed by `extra` TOML.
pub fn config(cpus: usize, extra: &str) -> VmConfig {
    let raw = format!(
        "id = 1\nname = \"guest\"\ncpu_num = {}\nentry_point = {}\ndtb_addr = {}\n\
         ram_base = {}\nram_size = 0x10_0000\nclock_scale = 50\n{}",
        cpus, ENTRY, DTB, RAM_BASE, extra
    );
    VmConfig::from_toml(&raw).unwrap()
}

#[derive(Default)]
pub struct CpuState {
    pub ctx: ContextFrame,
    pub started: Vec<(usize, usize)>,
    pub resumes: usize,
    pub acked: Vec<u32>,
    pub suspended: bool,
    pub timer: VirtualTimer,
}

pub type Cpu = Arc<Mutex<CpuState>>;

pub struct MockVCpu(pub Cpu);

impl ArchVCpu for MockVCpu {
    fn start(&mut self, entry: usize, arg: usize) -> AxResult {
        let mut cpu = self.0.lock().unwrap();
        cpu.started.push((entry, arg));
        cpu.ctx = ContextFrame::new(entry, arg);
        cpu.suspended = false;
        Ok(())
    }

    fn resume(&mut self) -> AxResult {
        self.0.lock().unwrap().resumes += 1;
        Ok(())
    }

    fn read_context(&mut self) -> AxResult<ContextFrame> {
        Ok(self.0.lock().unwrap().ctx)
    }

    fn write_context(&mut self, ctx: &ContextFrame) -> AxResult {
        self.0.lock().unwrap().ctx = *ctx;
        Ok(())
    }

    fn vtimer(&mut self) -> AxResult<VirtualTimer> {
        Ok(self.0.lock().unwrap().timer)
    }

    fn ack_vppi(&mut self, irq: u32) -> AxResult {
        self.0.lock().unwrap().acked.push(irq);
        Ok(())
    }

    fn suspend(&mut self) -> AxResult {
        self.0.lock().unwrap().suspended = true;
        Ok(())
    }
}

/// One scripted host event.
pub enum Step {
    /// An exit, after loading `regs` into the guest register file.
    Exit {
        esr: u64,
        ipa: usize,
        regs: Vec<(usize, u64)>,
    },
    Ppi(u32),
    Notify(u64),
}

impl Step {
    pub fn exit(esr: u64, ipa: usize) -> Self {
        Step::Exit {
            esr,
            ipa,
            regs: Vec::new(),
        }
    }

    pub fn with_regs(esr: u64, regs: &[(usize, u64)]) -> Self {
        Step::Exit {
            esr,
            ipa: 0,
            regs: regs.to_vec(),
        }
    }
}

#[derive(Default)]
pub struct PortLog {
    /// Timeouts passed to every wait.
    pub waits: Vec<Option<Duration>>,
    /// Labels returned by successive waits.
    pub wake: VecDeque<Option<u64>>,
    /// Labels returned by successive polls.
    pub pending: VecDeque<u64>,
    /// Resume count of the vCPU at each poll that found a label.
    pub polled_at: Vec<usize>,
}

/// Replays a script. Runs out with `NotConnected`.
pub struct ScriptedPort {
    steps: VecDeque<Step>,
    cpu: Cpu,
    pub log: Arc<Mutex<PortLog>>,
}

impl HostPort for ScriptedPort {
    fn recv(&mut self) -> AxResult<HostEvent> {
        match self.steps.pop_front() {
            Some(Step::Exit { esr, ipa, regs }) => {
                let mut cpu = self.cpu.lock().unwrap();
                for (reg, val) in regs {
                    cpu.ctx.gpr[reg] = val;
                }
                Ok(HostEvent::Fault(ExitSyndrome::new(esr, ipa)))
            }
            Some(Step::Ppi(irq)) => Ok(HostEvent::VirtualPpi { irq }),
            Some(Step::Notify(label)) => Ok(HostEvent::Notification { label }),
            None => Err(AxError::NotConnected),
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> AxResult<Option<u64>> {
        let mut log = self.log.lock().unwrap();
        log.waits.push(timeout);
        Ok(log.wake.pop_front().flatten())
    }

    fn poll(&mut self) -> AxResult<Option<u64>> {
        let resumes = self.cpu.lock().unwrap().resumes;
        let mut log = self.log.lock().unwrap();
        let label = log.pending.pop_front();
        if label.is_some() {
            log.polled_at.push(resumes);
        }
        Ok(label)
    }
}

pub struct TestHal;

impl CapVmHal for TestHal {
    type VCpu = MockVCpu;
    type Port = ScriptedPort;
}

#[derive(Default)]
pub struct RecordingVgic {
    pub injected: Mutex<Vec<(u32, usize)>>,
    pub pending: AtomicBool,
    eoi: Mutex<HashMap<u32, EoiHandler>>,
}

impl RecordingVgic {
    pub fn count(&self, irq: u32) -> usize {
        self.injected
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i == irq)
            .count()
    }

    /// Plays the guest's end-of-interrupt for `irq`.
    pub fn eoi(&self, irq: u32) {
        if let Some(handler) = self.eoi.lock().unwrap().get(&irq) {
            handler(irq);
        }
    }
}

impl Vgic for RecordingVgic {
    fn inject(&self, irq: u32, cpu: usize) -> AxResult {
        self.injected.lock().unwrap().push((irq, cpu));
        Ok(())
    }

    fn schedule_pending(&self, _cpu: usize) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn set_eoi_handler(&self, irq: u32, handler: EoiHandler) -> AxResult {
        self.eoi.lock().unwrap().insert(irq, handler);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingStage2 {
    pub mapped: Mutex<Vec<(usize, MappingFlags)>>,
}

impl Stage2Mapper for RecordingStage2 {
    fn map_identity(&self, page: usize, flags: MappingFlags) -> AxResult {
        self.mapped.lock().unwrap().push((page, flags));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingConsole {
    pub output: Mutex<Vec<u8>>,
    pub input: Mutex<VecDeque<u8>>,
}

impl HostConsole for RecordingConsole {
    fn read(&self, buf: &mut [u8]) -> AxResult<usize> {
        let mut input = self.input.lock().unwrap();
        if input.is_empty() {
            return Err(AxError::WouldBlock);
        }
        let n = buf.len().min(input.len());
        for b in buf.iter_mut().take(n) {
            *b = input.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> AxResult {
        self.output.lock().unwrap().extend_from_slice(data);
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingIrq {
    pub acks: Mutex<usize>,
}

impl HostIrq for CountingIrq {
    fn ack(&self) -> AxResult {
        *self.acks.lock().unwrap() += 1;
        Ok(())
    }
}

/// The host side of a test VM.
pub struct Host {
    pub cpus: Vec<Cpu>,
    pub ports: Vec<Arc<Mutex<PortLog>>>,
    pub vgic: Arc<RecordingVgic>,
    pub stage2: Arc<RecordingStage2>,
    pub console: Arc<RecordingConsole>,
}

impl Host {
    pub fn cpu(&self, id: usize) -> std::sync::MutexGuard<'_, CpuState> {
        self.cpus[id].lock().unwrap()
    }

    pub fn port(&self, id: usize) -> std::sync::MutexGuard<'_, PortLog> {
        self.ports[id].lock().unwrap()
    }
}

/// A builder for `config` with one scripted port per vCPU.
pub fn setup(config: VmConfig, scripts: Vec<Vec<Step>>) -> (VmBuilder<TestHal>, Host) {
    init_logger();
    let mut host = Host {
        cpus: Vec::new(),
        ports: Vec::new(),
        vgic: Arc::new(RecordingVgic::default()),
        stage2: Arc::new(RecordingStage2::default()),
        console: Arc::new(RecordingConsole::default()),
    };
    let mut builder = VmBuilder::new(
        config,
        host.vgic.clone(),
        host.stage2.clone(),
        host.console.clone(),
    );
    for steps in scripts {
        let cpu: Cpu = Arc::new(Mutex::new(CpuState::default()));
        let log = Arc::new(Mutex::new(PortLog::default()));
        let port = ScriptedPort {
            steps: steps.into(),
            cpu: cpu.clone(),
            log: log.clone(),
        };
        builder = builder.vcpu(MockVCpu(cpu.clone()), port);
        host.cpus.push(cpu);
        host.ports.push(log);
    }
    (builder, host)
}

const fn esr(ec: u64, iss: u64) -> u64 {
    (ec << 26) | (1 << 25) | iss
}

pub const WFI: u64 = esr(0x01, 0);
pub const WFE: u64 = esr(0x01, 1);
pub const HVC: u64 = esr(0x16, 0);
pub const SMC: u64 = esr(0x17, 0);

/// A data abort with a valid syndrome. `sas` is log2 of the access size.
pub const fn data_abort(sas: u64, write: bool, reg: u64, sign_extend: bool, reg_64bit: bool) -> u64 {
    esr(
        0x24,
        (1 << 24)
            | (sas << 22)
            | ((sign_extend as u64) << 21)
            | (reg << 16)
            | ((reg_64bit as u64) << 15)
            | ((write as u64) << 6)
            | 0b000111,
    )
}

/// A data abort without an instruction syndrome, as raised by `ldp`.
pub const DATA_ABORT_NO_ISV: u64 = esr(0x24, 0b000111);

pub const INSTRUCTION_ABORT: u64 = esr(0x20, 0b000111);

/// An aarch64 `MRS`/`MSR` trap.
pub const fn sysreg(op0: u64, op1: u64, crn: u64, crm: u64, op2: u64, rt: u64, read: bool) -> u64 {
    esr(
        0x18,
        (op0 << 20) | (op2 << 17) | (op1 << 14) | (crn << 10) | (rt << 5) | (crm << 1) | read as u64,
    )
}

/// An aarch32 `MRC`/`MCR p14` trap.
pub const fn cp14(opc1: u64, crn: u64, crm: u64, opc2: u64, rt: u64, read: bool) -> u64 {
    esr(
        0x05,
        (opc2 << 17) | (opc1 << 14) | (crn << 10) | (rt << 5) | (crm << 1) | read as u64,
    )
}
