//! A simulated guest to drive the walkers without running guest code.
//!
//! Guest memory is a [`SimMemory`], images come from [`ImageBuilder`], and
//! guest callbacks (language handlers, filters, `__finally` blocks, i386
//! exception routines) are Rust closures registered at guest addresses.
//! Every callback invocation is appended to [`SimPlatform::log`].
//!
//! Transfers that never return (restoring a context, terminating the
//! process) unwind the host stack back to [`SimPlatform::run`], which reports
//! how the guest code ended.

pub mod asm;
pub mod image;
pub mod memory;

pub use image::{FunctionBuilder, Image, ImageBuilder, PlacedFunction, TEXT_RVA};
pub use memory::SimMemory;

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::amd64::c_specific::c_specific_handler;
use crate::amd64::dispatcher::DispatcherContext;
use crate::context::{Context32, Context64, CONTEXT_AMD64_FULL, CONTEXT_I386_FULL};
use crate::env::{
    Dispatch32, Dispatch64, Memory, Module, ModuleRegistry, Process, ThreadControl,
    ThreadEnvironment, ThreadHandle,
};
use crate::error::Result;
use crate::i386::chain::RegistrationChain;
use crate::record::{ExceptionFlags, ExceptionPointers, ExceptionRecord};
use crate::stack::{SignalStack, StackLimits};
use crate::status::{ExceptionDisposition, NtStatus, EXCEPTION_CONTINUE_SEARCH, STATUS_SUCCESS};
use crate::Addr;

pub type LanguageHandlerFn = Rc<
    dyn Fn(&mut SimPlatform, &mut ExceptionRecord, u64, &mut Context64, &mut DispatcherContext) -> u32,
>;
pub type FilterFn = Rc<dyn Fn(&mut SimPlatform, ExceptionPointers<'_>, u64) -> i32>;
pub type FinallyFn = Rc<dyn Fn(&mut SimPlatform, bool, u64)>;
pub type ConsolidateFn = Rc<dyn Fn(&mut SimPlatform, &mut ExceptionRecord) -> u64>;
pub type RoutineFn = Rc<
    dyn Fn(
        &mut SimPlatform,
        &mut ExceptionRecord,
        u32,
        &mut Context32,
        &mut u32,
        &mut RegistrationChain,
    ) -> u32,
>;

#[derive(Clone)]
enum GuestFn {
    Language(LanguageHandlerFn),
    CSpecific,
    Filter(FilterFn),
    Finally(FinallyFn),
    Consolidate(ConsolidateFn),
    Routine(RoutineFn),
}

/// A call into guest code, as recorded in [`SimPlatform::log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Handler {
        handler: u64,
        frame: u64,
        flags: ExceptionFlags,
    },
    Filter {
        filter: u64,
        frame: u64,
    },
    Finally {
        handler: u64,
        frame: u64,
        abnormal: bool,
    },
    Consolidate {
        callback: u64,
        rip: u64,
        rsp: u64,
    },
    Routine {
        routine: u32,
        frame: u32,
        flags: ExceptionFlags,
    },
}

/// How a [`SimPlatform::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The closure returned normally.
    Returned(T),
    /// A context was restored on the calling thread.
    Resumed(Box<Context64>),
    Resumed32(Box<Context32>),
    /// The process was terminated with this status.
    Terminated(NtStatus),
}

impl<T> Outcome<T> {
    pub fn resumed(self) -> Option<Context64> {
        match self {
            Outcome::Resumed(context) => Some(*context),
            _ => None,
        }
    }

    pub fn resumed32(self) -> Option<Context32> {
        match self {
            Outcome::Resumed32(context) => Some(*context),
            _ => None,
        }
    }

    pub fn terminated(&self) -> Option<NtStatus> {
        match *self {
            Outcome::Terminated(status) => Some(status),
            _ => None,
        }
    }
}

/// Payload of the host unwinds that model non-returning transfers.
enum Transfer {
    Resume(Box<Context64>),
    Resume32(Box<Context32>),
    Terminate(NtStatus),
}

pub struct SimPlatform {
    pub memory: SimMemory,
    pub modules: Vec<Module>,
    pub limits: StackLimits,
    pub signal_stack: Option<SignalStack>,
    /// What `capture` returns: the registers of the guest code calling in.
    pub context: Context64,
    pub context32: Context32,
    /// Contexts handed to other threads.
    pub remote: Vec<(ThreadHandle, Context64)>,
    pub remote32: Vec<(ThreadHandle, Context32)>,
    pub log: Vec<Event>,
    guest: BTreeMap<u64, GuestFn>,
    symbols: BTreeMap<u64, String>,
}

impl SimPlatform {
    /// A guest whose stack is mapped at `[limit, base)`.
    pub fn new(limits: StackLimits) -> Self {
        let mut memory = SimMemory::new();
        memory.map(limits.limit, (limits.base - limits.limit) as usize);
        let context = Context64 {
            context_flags: CONTEXT_AMD64_FULL,
            ..Default::default()
        };
        let context32 = Context32 {
            context_flags: CONTEXT_I386_FULL,
            ..Default::default()
        };
        Self {
            memory,
            modules: Vec::new(),
            limits,
            signal_stack: None,
            context,
            context32,
            remote: Vec::new(),
            remote32: Vec::new(),
            log: Vec::new(),
            guest: BTreeMap::new(),
            symbols: BTreeMap::new(),
        }
    }

    pub fn load(&mut self, image: Image) -> Module {
        self.memory.map_bytes(image.module.base, image.bytes);
        self.modules.push(image.module);
        image.module
    }

    /// Names `address` in last chance reports.
    pub fn name(&mut self, address: u64, name: &str) {
        self.symbols.insert(address, name.to_owned());
    }

    pub fn language_handler(
        &mut self,
        address: u64,
        handler: impl Fn(&mut SimPlatform, &mut ExceptionRecord, u64, &mut Context64, &mut DispatcherContext) -> u32
            + 'static,
    ) {
        self.guest.insert(address, GuestFn::Language(Rc::new(handler)));
    }

    /// Makes `address` behave like `__C_specific_handler`.
    pub fn c_specific_handler(&mut self, address: u64) {
        self.guest.insert(address, GuestFn::CSpecific);
    }

    pub fn filter(
        &mut self,
        address: u64,
        filter: impl Fn(&mut SimPlatform, ExceptionPointers<'_>, u64) -> i32 + 'static,
    ) {
        self.guest.insert(address, GuestFn::Filter(Rc::new(filter)));
    }

    /// A filter that always returns `verdict`.
    pub fn fixed_filter(&mut self, address: u64, verdict: i32) {
        self.filter(address, move |_, _, _| verdict);
    }

    pub fn finally(&mut self, address: u64, handler: impl Fn(&mut SimPlatform, bool, u64) + 'static) {
        self.guest.insert(address, GuestFn::Finally(Rc::new(handler)));
    }

    /// A `__finally` block that only shows up in the log.
    pub fn empty_finally(&mut self, address: u64) {
        self.finally(address, |_, _, _| {});
    }

    pub fn consolidate_callback(
        &mut self,
        address: u64,
        callback: impl Fn(&mut SimPlatform, &mut ExceptionRecord) -> u64 + 'static,
    ) {
        self.guest.insert(address, GuestFn::Consolidate(Rc::new(callback)));
    }

    pub fn exception_routine(
        &mut self,
        address: u32,
        routine: impl Fn(
                &mut SimPlatform,
                &mut ExceptionRecord,
                u32,
                &mut Context32,
                &mut u32,
                &mut RegistrationChain,
            ) -> u32
            + 'static,
    ) {
        self.guest
            .insert(u64::from(address), GuestFn::Routine(Rc::new(routine)));
    }

    fn guest_fn(&self, address: u64) -> Option<GuestFn> {
        let guest = self.guest.get(&address).cloned();
        if guest.is_none() {
            warn!(address = ?Addr(address), "nothing registered at guest address");
        }
        guest
    }

    /// Runs `f`, catching the transfers that leave it for good.
    pub fn run<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> Outcome<T> {
        match panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(value) => Outcome::Returned(value),
            Err(payload) => match payload.downcast::<Transfer>() {
                Ok(transfer) => match *transfer {
                    Transfer::Resume(context) => Outcome::Resumed(context),
                    Transfer::Resume32(context) => Outcome::Resumed32(context),
                    Transfer::Terminate(status) => Outcome::Terminated(status),
                },
                Err(payload) => panic::resume_unwind(payload),
            },
        }
    }
}

impl Memory for SimPlatform {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.memory.read_bytes(addr, buf)
    }
}

impl ModuleRegistry for SimPlatform {
    fn find_module(&self, pc: u64) -> Option<Module> {
        self.modules.iter().find(|module| module.contains(pc)).copied()
    }

    fn symbolize(&self, pc: u64) -> Option<String> {
        self.symbols.get(&pc).cloned()
    }
}

impl ThreadEnvironment for SimPlatform {
    fn stack_limits(&self) -> StackLimits {
        self.limits
    }

    fn signal_stack(&self) -> Option<SignalStack> {
        self.signal_stack
    }
}

impl ThreadControl<Context64> for SimPlatform {
    fn capture(&mut self) -> Context64 {
        self.context.clone()
    }

    fn restore(&mut self, context: &Context64) -> ! {
        debug!(rip = ?Addr(context.rip), rsp = ?Addr(context.rsp()), "resuming");
        panic::resume_unwind(Box::new(Transfer::Resume(Box::new(context.clone()))))
    }

    fn set_remote_context(&mut self, thread: ThreadHandle, context: &Context64) -> NtStatus {
        self.remote.push((thread, context.clone()));
        STATUS_SUCCESS
    }
}

impl ThreadControl<Context32> for SimPlatform {
    fn capture(&mut self) -> Context32 {
        self.context32.clone()
    }

    fn restore(&mut self, context: &Context32) -> ! {
        debug!(eip = ?Addr(u64::from(context.eip)), esp = ?Addr(u64::from(context.esp)), "resuming");
        panic::resume_unwind(Box::new(Transfer::Resume32(Box::new(context.clone()))))
    }

    fn set_remote_context(&mut self, thread: ThreadHandle, context: &Context32) -> NtStatus {
        self.remote32.push((thread, context.clone()));
        STATUS_SUCCESS
    }
}

impl Process for SimPlatform {
    fn terminate(&mut self, status: NtStatus) -> ! {
        debug!(status = ?Addr(u64::from(status)), "terminating");
        panic::resume_unwind(Box::new(Transfer::Terminate(status)))
    }
}

impl Dispatch64 for SimPlatform {
    fn call_language_handler(
        &mut self,
        handler: u64,
        record: &mut ExceptionRecord,
        frame: u64,
        context: &mut Context64,
        dispatch: &mut DispatcherContext,
    ) -> u32 {
        self.log.push(Event::Handler {
            handler,
            frame,
            flags: record.flags,
        });
        match self.guest_fn(handler) {
            Some(GuestFn::Language(f)) => f(self, record, frame, context, dispatch),
            Some(GuestFn::CSpecific) => {
                c_specific_handler(self, record, frame, context, dispatch) as u32
            }
            _ => ExceptionDisposition::ContinueSearch as u32,
        }
    }

    fn call_filter(&mut self, filter: u64, pointers: ExceptionPointers<'_>, frame: u64) -> i32 {
        self.log.push(Event::Filter { filter, frame });
        match self.guest_fn(filter) {
            Some(GuestFn::Filter(f)) => f(self, pointers, frame),
            _ => EXCEPTION_CONTINUE_SEARCH,
        }
    }

    fn call_termination_handler(&mut self, handler: u64, abnormal: bool, frame: u64) {
        self.log.push(Event::Finally {
            handler,
            frame,
            abnormal,
        });
        if let Some(GuestFn::Finally(f)) = self.guest_fn(handler) {
            f(self, abnormal, frame);
        }
    }

    fn call_consolidate_callback(
        &mut self,
        context: &Context64,
        callback: u64,
        record: &mut ExceptionRecord,
    ) -> u64 {
        self.log.push(Event::Consolidate {
            callback,
            rip: context.rip,
            rsp: context.rsp(),
        });
        // anything the callback captures looks like it was called from `context`
        self.context = context.clone();
        match self.guest_fn(callback) {
            Some(GuestFn::Consolidate(f)) => f(self, record),
            _ => context.rip,
        }
    }
}

impl Dispatch32 for SimPlatform {
    fn call_exception_routine(
        &mut self,
        routine: u32,
        record: &mut ExceptionRecord,
        frame: u32,
        context: &mut Context32,
        dispatcher: &mut u32,
        chain: &mut RegistrationChain,
    ) -> u32 {
        self.log.push(Event::Routine {
            routine,
            frame,
            flags: record.flags,
        });
        match self.guest_fn(u64::from(routine)) {
            Some(GuestFn::Routine(f)) => f(self, record, frame, context, dispatcher, chain),
            _ => ExceptionDisposition::ContinueSearch as u32,
        }
    }
}
