//! Diagnostics printed when an exception cannot be delivered.

use core::ffi::{c_void, CStr};
use core::fmt::Write;
use core::mem;
use core::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use log::error;

use crate::config;
use crate::error::{DemangleError, TerminateReason};
use crate::handlers::{terminate_handler, terminate_with_handler, Handler};
use crate::rtti::TypeInfo;
use crate::unwind::UnwindReasonCode;

/// Turns a mangled type name into a readable one.
pub type Demangler = fn(&CStr) -> Result<String, DemangleError>;

static DEMANGLER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Installs the demangling service used by uncaught-exception reports.
/// `None` restores [`demangle_type_name`].
pub fn set_demangler(demangler: Option<Demangler>) {
    let raw = demangler.map_or(ptr::null_mut(), |demangler| demangler as *mut ());
    DEMANGLER.store(raw, Ordering::Release);
}

fn demangler() -> Demangler {
    let raw = DEMANGLER.load(Ordering::Acquire);
    if raw.is_null() {
        demangle_type_name
    } else {
        unsafe { mem::transmute::<*mut (), Demangler>(raw) }
    }
}

const TYPEINFO_NAME_PREFIX: &str = "typeinfo name for ";

/// Demangles a type name as stored in a `type_info` (`3Foo`, `PKi`).
pub fn demangle_type_name(name: &CStr) -> Result<String, DemangleError> {
    if name.is_empty() {
        return Err(DemangleError::InvalidArguments);
    }
    // Type names carry no `_Z` prefix, so demangle the typeinfo name symbol
    let mut symbol = b"_ZTS".to_vec();
    symbol.extend_from_slice(name.to_bytes());
    let demangled = cpp_demangle::Symbol::new(symbol)
        .map_err(|_| DemangleError::InvalidMangledName)?
        .demangle(&cpp_demangle::DemangleOptions::default())
        .map_err(|_| DemangleError::InvalidMangledName)?;
    match demangled.strip_prefix(TYPEINFO_NAME_PREFIX) {
        Some(ty) => Ok(ty.to_string()),
        None => Err(DemangleError::InvalidMangledName),
    }
}

/// The name to print for `ty`: demangled if possible, else as mangled.
pub fn display_name(ty: &TypeInfo, demangler: Option<Demangler>) -> String {
    let mangled = ty.name();
    match demangler.map(|demangle| demangle(mangled)) {
        Some(Ok(name)) => name,
        _ => mangled.to_string_lossy().into_owned(),
    }
}

/// The first line of the uncaught-exception report.
pub fn describe_uncaught(
    payload: *const c_void,
    ty: Option<&TypeInfo>,
    demangler: Option<Demangler>,
) -> String {
    match ty {
        Some(ty) => format!(
            "Terminating due to uncaught exception {payload:p} of type {}",
            display_name(ty, demangler)
        ),
        None => format!("Terminating due to uncaught foreign exception {payload:p}"),
    }
}

/// One line per frame of the current stack: `ip:symbol in file`.
pub fn format_backtrace() -> String {
    let mut out = String::new();
    backtrace::trace(|frame| {
        let ip = frame.ip();
        let mut resolved = false;
        backtrace::resolve_frame(frame, |symbol| {
            resolved = true;
            let name = symbol
                .name()
                .map_or_else(|| "???".to_string(), |name| name.to_string());
            let file = symbol
                .filename()
                .map_or_else(|| "???".to_string(), |path| path.display().to_string());
            let _ = writeln!(out, "{ip:p}:{name} in {file}");
        });
        if !resolved {
            let _ = writeln!(out, "{ip:p}:??? in ???");
        }
        true
    });
    out
}

/// Reports why an exception could not be delivered, then terminates.
///
/// `payload` and `ty` describe the exception for the end-of-stack report;
/// `ty` is `None` for foreign exceptions. `handler` is the terminate hook
/// captured when the exception was thrown; `None` uses the current one.
pub fn report_failure(
    code: UnwindReasonCode,
    payload: *const c_void,
    ty: Option<&TypeInfo>,
    handler: Option<Handler>,
) -> ! {
    let handler = handler.unwrap_or_else(terminate_handler);
    match code {
        UnwindReasonCode::FatalPhase1Error => {
            terminate_with_handler(TerminateReason::FatalPhase1, handler)
        }
        UnwindReasonCode::FatalPhase2Error => {
            terminate_with_handler(TerminateReason::FatalPhase2, handler)
        }
        UnwindReasonCode::EndOfStack => {
            let report = describe_uncaught(payload, ty, Some(demangler()));
            error!("{report}");
            eprintln!("{report}");
            if config::current().backtrace_on_uncaught {
                eprint!("{}", format_backtrace());
            }
            terminate_with_handler(TerminateReason::Uncaught, handler)
        }
        other => {
            error!("unwinder returned {other:?}");
            terminate_with_handler(TerminateReason::Uncaught, handler)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pretty(name: &CStr) -> Result<String, DemangleError> {
        match name.to_bytes() {
            b"3Foo" => Ok("Foo".to_string()),
            _ => Err(DemangleError::InvalidMangledName),
        }
    }

    #[test]
    fn test_display_name() {
        let foo = TypeInfo::fundamental(c"3Foo");
        let bar = TypeInfo::fundamental(c"3Bar");
        assert_eq!(display_name(&foo, Some(pretty)), "Foo");
        assert_eq!(display_name(&bar, Some(pretty)), "3Bar");
        assert_eq!(display_name(&foo, None), "3Foo");
    }

    #[test]
    fn test_describe_uncaught() {
        let int = TypeInfo::fundamental(c"i");
        let value = 1i32;
        let payload: *const c_void = (&value as *const i32).cast();

        let line = describe_uncaught(payload, Some(&int), None);
        assert!(line.starts_with("Terminating due to uncaught exception 0x"));
        assert!(line.ends_with(" of type i"));
        assert!(describe_uncaught(payload, None, None).contains("foreign"));
    }

    #[test]
    fn test_demangler_registration() {
        let foo = TypeInfo::fundamental(c"3Foo");
        let bar = TypeInfo::fundamental(c"3Bar");
        set_demangler(Some(pretty));
        assert_eq!(display_name(&bar, Some(demangler())), "3Bar");
        set_demangler(None);
        assert_eq!(display_name(&bar, Some(demangler())), "Bar");
        assert_eq!(display_name(&foo, Some(demangler())), "Foo");
    }

    #[test]
    fn test_default_demangler() {
        assert_eq!(demangle_type_name(c"3Foo").as_deref(), Ok("Foo"));
        assert_eq!(demangle_type_name(c"i").as_deref(), Ok("int"));
        assert_eq!(demangle_type_name(c"N2ns3BarE").as_deref(), Ok("ns::Bar"));
        assert_eq!(demangle_type_name(c""), Err(DemangleError::InvalidArguments));
        assert_eq!(demangle_type_name(c"3Fo"), Err(DemangleError::InvalidMangledName));

        let foo = TypeInfo::fundamental(c"3Foo");
        let line = describe_uncaught(ptr::null(), Some(&foo), Some(demangle_type_name));
        assert!(line.ends_with(" of type Foo"));
    }

    unsafe extern "C-unwind" fn unwinding_hook() {
        panic!("terminate hook ran");
    }

    #[test]
    fn test_failure_runs_hook_captured_at_throw() {
        let int = TypeInfo::fundamental(c"i");
        let value = 7i32;
        let payload: *const c_void = (&value as *const i32).cast();
        for code in [
            UnwindReasonCode::EndOfStack,
            UnwindReasonCode::FatalPhase1Error,
            UnwindReasonCode::FatalPhase2Error,
        ] {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                report_failure(code, payload, Some(&int), Some(unwinding_hook))
            }));
            let message = result.unwrap_err();
            assert_eq!(message.downcast_ref::<&str>(), Some(&"terminate hook ran"));
        }
    }

    #[test]
    fn test_backtrace_has_frames() {
        let trace = format_backtrace();
        assert!(trace.lines().count() > 0);
        assert!(trace.lines().all(|line| line.contains(" in ")));
    }

    #[test]
    fn test_demangle_status_codes() {
        assert_eq!(DemangleError::AllocationFailure.status(), -1);
        assert_eq!(DemangleError::InvalidMangledName.status(), -2);
        assert_eq!(DemangleError::InvalidArguments.status(), -3);
    }
}
