//! The i386 walkers. Handlers are found through the registration chain
//! rooted in the TEB instead of through unwind tables.

pub mod chain;
pub mod raise;
pub mod unwind;

pub use chain::{ChainGuard, Phase, RegistrationChain, RegistrationRecord, CHAIN_END};
pub use raise::{
    call_stack_handlers, nt_raise_exception, raise_exception, raise_status, set_context_thread,
};
pub use unwind::rtl_unwind;

#[cfg(test)]
mod tests;
