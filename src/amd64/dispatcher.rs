//! State shared between the frame walkers and the language handlers they call.

use super::function_table::{lookup_function_entry, FunctionEntry, UnwindHistoryTable};
use super::virtual_unwind::virtual_unwind;
use crate::context::Context64;
use crate::env::{Dispatch64, Memory, ModuleRegistry};
use crate::error::Result;
use crate::record::ExceptionRecord;
use crate::status::UNW_FLAG_NHANDLER;
use crate::Addr;

/// A language specific handler found in an `UNWIND_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageHandler {
    pub address: u64,
    /// The language specific data following the handler rva, for
    /// `__C_specific_handler` a [`super::ScopeTable`].
    pub data: u64,
}

/// `DISPATCHER_CONTEXT`. Rebuilt by the walker for every frame, handed to
/// the language handler by mutable reference.
#[derive(Debug, Clone)]
pub struct DispatcherContext {
    pub control_pc: u64,
    pub image_base: u64,
    pub function_entry: Option<FunctionEntry>,
    pub establisher_frame: u64,
    /// Where an unwind will continue, zero during the search.
    pub target_ip: u64,
    /// `ContextRecord`: the context of the frame being dispatched.
    pub context: Context64,
    /// Zero if the frame has no handler.
    pub language_handler: u64,
    pub handler_data: u64,
    /// The first scope table entry the handler still has to look at.
    pub scope_index: u32,
}

impl DispatcherContext {
    pub fn new(target_ip: u64, context: &Context64) -> Self {
        Self {
            control_pc: context.rip,
            image_base: 0,
            function_entry: None,
            establisher_frame: context.rsp(),
            target_ip,
            context: context.clone(),
            language_handler: 0,
            handler_data: 0,
            scope_index: 0,
        }
    }

    pub fn handler(&self) -> Option<LanguageHandler> {
        (self.language_handler != 0).then_some(LanguageHandler {
            address: self.language_handler,
            data: self.handler_data,
        })
    }

    fn set_handler(&mut self, handler: Option<LanguageHandler>) {
        let handler = handler.unwrap_or(LanguageHandler {
            address: 0,
            data: 0,
        });
        self.language_handler = handler.address;
        self.handler_data = handler.data;
    }
}

/// Resolves the frame `context` is in and unwinds `context` to its caller,
/// leaving the result of the lookup in `dispatch`.
///
/// Frames without a function entry are leaf functions, their return address
/// is at `rsp`.
pub(crate) fn lookup_frame<E: Memory + ModuleRegistry + ?Sized>(
    env: &E,
    handler_type: u8,
    dispatch: &mut DispatcherContext,
    context: &mut Context64,
    history: Option<&mut UnwindHistoryTable>,
) -> Result<()> {
    dispatch.image_base = 0;
    dispatch.scope_index = 0;
    dispatch.control_pc = context.rip;
    dispatch.function_entry = lookup_function_entry(env, context.rip, history);

    match dispatch.function_entry {
        Some(entry) => {
            dispatch.image_base = entry.image_base;
            let unwound = virtual_unwind(
                env,
                handler_type,
                entry.image_base,
                dispatch.control_pc,
                &entry.function,
                context,
                None,
            )?;
            dispatch.establisher_frame = unwound.establisher_frame;
            dispatch.set_handler(unwound.handler);
            trace!(
                handler = ?unwound.handler.map(|h| Addr(h.address)),
                entry = ?Addr(entry.address),
                pc = ?Addr(dispatch.control_pc),
                frame = ?Addr(dispatch.establisher_frame),
                "found function entry"
            );
        }
        None => {
            let rsp = context.rsp();
            context.rip = env.read_u64(rsp)?;
            context.set_rsp(rsp.wrapping_add(8));
            dispatch.establisher_frame = context.rsp();
            dispatch.set_handler(None);
            trace!(rip = ?Addr(context.rip), rsp = ?Addr(context.rsp()), "leaf function");
        }
    }
    Ok(())
}

/// After a collided unwind: continues from the context the handler left in
/// `dispatch`, unwound once more without looking for handlers. The
/// establisher frame and handler stay what the handler reported.
pub(crate) fn resync_collided<M: Memory + ?Sized>(
    mem: &M,
    dispatch: &DispatcherContext,
) -> Result<Context64> {
    let mut context = dispatch.context.clone();
    if let Some(entry) = dispatch.function_entry {
        virtual_unwind(
            mem,
            UNW_FLAG_NHANDLER,
            dispatch.image_base,
            dispatch.control_pc,
            &entry.function,
            &mut context,
            None,
        )?;
    }
    debug!(
        pc = ?Addr(dispatch.control_pc),
        frame = ?Addr(dispatch.establisher_frame),
        "collided unwind, continuing from the handler's dispatcher context"
    );
    Ok(context)
}

/// Calls the handler of the current frame with `context` as the context
/// record it sees.
pub(crate) fn call_handler<E: Dispatch64 + ?Sized>(
    env: &mut E,
    record: &mut ExceptionRecord,
    dispatch: &mut DispatcherContext,
    context: &mut Context64,
) -> u32 {
    let handler = dispatch.language_handler;
    let frame = dispatch.establisher_frame;
    debug!(handler = ?Addr(handler), frame = ?Addr(frame), "calling handler");
    let ret = env.call_language_handler(handler, record, frame, context, dispatch);
    debug!(ret, "handler returned");
    ret
}
