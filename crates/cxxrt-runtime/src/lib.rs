//! Runtime support for compiled C++ code.
//!
//! This library provides the pieces of the Itanium C++ ABI that compiled
//! code calls into, including:
//!
//! - Exception handling (throw / catch / rethrow, the personality routine)
//! - Runtime type identification (`type_info`, `dynamic_cast`)
//! - Thread-safe initialization of function-local statics
//! - terminate / unexpected hooks
//!
//! # Architecture
//!
//! The compiler lowers C++ constructs to calls into this runtime and emits
//! DWARF unwind tables that name [`personality::cxxrt_personality_v0`]. For
//! example:
//!
//! ```cpp
//! try {
//!     might_throw();
//! } catch (const std::exception& e) {
//!     handle(e);
//! }
//! ```
//!
//! Becomes, on the throwing side:
//!
//! ```text
//! p = cxxrt_allocate_exception(sizeof(T));
//! new (p) T(...);
//! cxxrt_throw(p, &typeid(T), &T::~T);   // hands off to the unwinder
//! ```
//!
//! and on the catching side, a landing pad that the personality routine
//! selects:
//!
//! ```text
//! e = cxxrt_begin_catch(exception_header);
//! handle(e);
//! cxxrt_end_catch();
//! ```
//!
//! Entry points are exported with a `cxxrt_` prefix by default; the
//! `itanium-abi` feature exports them under their ABI names instead.

pub mod cast;
pub mod config;
pub mod dwarf;
pub mod error;
pub mod exceptions;
pub mod guard;
pub mod handlers;
pub mod memory;
pub mod personality;
pub mod report;
pub mod rtti;
pub mod thread_state;
pub mod unwind;

pub use cast::{cxxrt_dynamic_cast, dynamic_cast, match_catch};
pub use config::RuntimeConfig;
pub use error::{AllocError, ConfigError, DemangleError, LsdaError, TerminateReason};
pub use exceptions::{
    cxxrt_begin_catch, cxxrt_call_unexpected, cxxrt_current_exception_type, cxxrt_end_catch,
    cxxrt_get_exception_ptr, cxxrt_rethrow, cxxrt_throw, Envelope, HandlerCount,
    EXCEPTION_CLASS,
};
pub use guard::{cxxrt_guard_abort, cxxrt_guard_acquire, cxxrt_guard_release, GuardWord};
pub use handlers::{
    set_terminate, set_unexpected, set_use_thread_local_handlers, terminate, terminate_with,
    uncaught_exception, uncaught_exceptions, unexpected, Handler,
};
pub use memory::{cxxrt_allocate_exception, cxxrt_free_exception};
pub use personality::cxxrt_personality_v0;
pub use rtti::{ClassTypeInfo, TypeInfo};
pub use thread_state::{cxxrt_get_globals, cxxrt_get_globals_fast};

/// Runtime version for compatibility checking.
pub const RUNTIME_VERSION: u32 = 1;

/// Initialize the runtime.
///
/// Loads the configuration from the environment and applies it. Safe to
/// call more than once; only the first call loads anything.
#[no_mangle]
pub extern "C" fn cxxrt_init() {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config::install(config).unwrap_or_else(|_| config::current()),
        Err(err) => {
            log::warn!("ignoring runtime configuration: {err}");
            config::current()
        }
    };
    log::debug!("cxxrt runtime v{RUNTIME_VERSION} initialized: {config:?}");
    handlers::set_use_thread_local_handlers(config.thread_local_handlers);
}

/// Shutdown the runtime.
///
/// Restores the built-in terminate and unexpected hooks and frees any
/// exceptions the calling thread is still handling.
#[no_mangle]
pub extern "C" fn cxxrt_shutdown() {
    thread_state::with(|state| state.reset());
    handlers::restore_defaults();
}
