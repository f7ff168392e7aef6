//! Table driven exception dispatch for x64 guests.
//!
//! Frames are found through the `RUNTIME_FUNCTION` tables of the loaded
//! images and popped by interpreting their `UNWIND_INFO`. Language handlers
//! (usually [`c_specific::c_specific_handler`]) decide what happens in each
//! frame.

pub mod backtrace;
pub mod c_specific;
pub mod dispatcher;
pub mod epilog;
pub mod function_table;
pub mod raise;
pub mod restore;
pub mod unwind;
pub mod unwind_info;
pub mod virtual_unwind;

pub use backtrace::{capture_stack_back_trace, BackTrace};
pub use c_specific::{c_specific_handler, ScopeRecord, ScopeTable};
pub use dispatcher::{DispatcherContext, LanguageHandler};
pub use function_table::{
    add_function_table, lookup_function_entry, FunctionEntry, RuntimeFunction,
    UnwindHistoryTable,
};
pub use raise::{call_stack_handlers, dispatch_fault, raise_exception, raise_status, rtl_raise_exception};
pub use restore::{restore_context, JumpBuffer};
pub use unwind::{local_unwind, unwind, unwind_ex};
pub use unwind_info::{UnwindCode, UnwindInfo, UnwindOp};
pub use virtual_unwind::{virtual_unwind, NonvolatilePointers, VirtualUnwind};
