//! The C++ personality routine.
//!
//! The unwinder calls this once per frame in each of its two phases:
//!
//! * search: decide whether this frame catches the exception. A match is
//!   cached on the envelope so the second phase need not repeat it.
//! * cleanup: for frames below the handler, run cleanups (destructors); for
//!   the handler frame, jump to the cached landing pad.
//!
//! The decision itself ([`decide_frame`]) is separate from acting on it
//! ([`personality_with`]) so that it can be examined without a real
//! unwinder.

use core::ffi::{c_int, c_void};
use core::ptr;

use log::{trace, warn};

use crate::cast::match_catch;
use crate::dwarf::{ActionRecord, CallSite, Lsda};
use crate::error::{LsdaError, TerminateReason};
use crate::exceptions::{Envelope, EXCEPTION_CLASS};
use crate::handlers::terminate_with;
use crate::rtti::TypeInfo;
use crate::unwind::{
    FrameContext, SystemFrame, UnwindActions, UnwindContext, UnwindException, UnwindReasonCode,
    UNWIND_DATA_REG,
};

/// How much of an action chain to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// Catch clauses and exception specifications as well as cleanups.
    Search,
    /// Cleanups only; type filters are skipped.
    CleanupOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    None,
    Cleanup,
    /// A catch clause matched, or an exception specification was violated.
    Catch,
}

/// Result of evaluating one call site's action chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionMatch {
    pub kind: HandlerKind,
    /// Value handed to the landing pad: the matching filter, or 0 for a
    /// cleanup.
    pub selector: i64,
    /// Pointer a matching catch clause binds to.
    pub adjusted_ptr: *mut c_void,
}

impl ActionMatch {
    const fn new(kind: HandlerKind) -> Self {
        Self {
            kind,
            selector: 0,
            adjusted_ptr: ptr::null_mut(),
        }
    }
}

/// A native exception as seen by the matcher.
#[derive(Debug, Clone, Copy)]
pub struct Thrown<'a> {
    pub ty: &'a TypeInfo,
    pub payload: *mut c_void,
}

/// Walks the action chain starting at `record`.
///
/// `thrown` is `None` for foreign exceptions, which only match cleanups and
/// `catch (...)`. For those the match carries a null `adjusted_ptr`;
/// `begin_catch` binds the clause to the address past the foreign header.
/// The first matching catch clause or violated specification wins;
/// a cleanup found on the way is reported only if nothing else matches.
///
/// # Safety
/// `record` must be null or an action record of `lsda`, and `thrown` must
/// describe a live exception.
pub unsafe fn check_action_record(
    lsda: &Lsda,
    mut record: *const u8,
    thrown: Option<Thrown<'_>>,
    scan: Scan,
) -> Result<ActionMatch, LsdaError> {
    if record.is_null() {
        return Ok(ActionMatch::new(HandlerKind::Cleanup));
    }

    let mut found = ActionMatch::new(HandlerKind::None);
    while !record.is_null() {
        let action = ActionRecord::read(record)?;
        record = action.next;

        match (action.filter, thrown, scan) {
            (0, _, _) => found = ActionMatch::new(HandlerKind::Cleanup),
            (filter, Some(thrown), Scan::Search) if filter > 0 => {
                let catch_type = lsda.type_info_entry(filter as u64)?;
                if let Some(adjusted_ptr) =
                    match_catch(thrown.ty, thrown.payload, catch_type.as_ref())
                {
                    return Ok(ActionMatch {
                        kind: HandlerKind::Catch,
                        selector: filter,
                        adjusted_ptr,
                    });
                }
            }
            (filter, Some(thrown), Scan::Search) => {
                let mut permitted = false;
                for index in lsda.exception_spec(filter)? {
                    let allowed = lsda.type_info_entry(index)?;
                    if match_catch(thrown.ty, thrown.payload, allowed.as_ref()).is_some() {
                        permitted = true;
                        break;
                    }
                }
                // A permitted type propagates on past this frame
                if !permitted {
                    return Ok(ActionMatch {
                        kind: HandlerKind::Catch,
                        selector: filter,
                        adjusted_ptr: thrown.payload,
                    });
                }
            }
            (filter, None, Scan::Search) if filter > 0 => {
                if lsda.type_info_entry(filter as u64)?.is_null() {
                    return Ok(ActionMatch {
                        kind: HandlerKind::Catch,
                        selector: filter,
                        adjusted_ptr: ptr::null_mut(),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(found)
}

/// What the personality routine decided for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing to do here; keep unwinding.
    Continue,
    /// Search phase: this frame handles the exception.
    HandlerFound,
    /// Cleanup phase: resume at `landing_pad` with `selector`.
    Install { landing_pad: usize, selector: i64 },
    /// The exception cannot be delivered.
    Terminate(TerminateReason),
    /// Return this code to the unwinder.
    Fatal(UnwindReasonCode),
}

unsafe fn locate<F: FrameContext>(
    frame: &F,
    lsda: *const u8,
) -> Result<(Lsda, Option<CallSite>), LsdaError> {
    let lsda = Lsda::parse(frame, lsda)?;
    let site = lsda.find_call_site(frame.call_site_ip())?;
    Ok((lsda, site))
}

/// Decides what to do with the exception in one frame.
///
/// Writes the search-phase cache into native envelopes and consumes it in
/// the cleanup phase.
///
/// # Safety
/// `header` must be a live exception header, and a native one if
/// `exception_class` is ours. The frame's LSDA must be readable.
pub unsafe fn decide_frame<F: FrameContext>(
    version: c_int,
    actions: UnwindActions,
    exception_class: u64,
    header: *mut UnwindException,
    frame: &F,
) -> Disposition {
    if version != 1 {
        return Disposition::Fatal(UnwindReasonCode::FatalPhase1Error);
    }

    let envelope =
        (exception_class == EXCEPTION_CLASS).then(|| Envelope::from_header(header));
    let thrown = envelope.and_then(|envelope| {
        (*envelope).exception_type().map(|ty| Thrown {
            ty,
            payload: Envelope::payload(envelope),
        })
    });

    let lsda_ptr = frame.language_specific_data();
    if lsda_ptr.is_null() {
        return Disposition::Continue;
    }

    if actions.contains(UnwindActions::SEARCH_PHASE) {
        let (lsda, site) = match locate(frame, lsda_ptr) {
            Ok((lsda, Some(site))) => (lsda, site),
            Ok((_, None)) | Err(_) => {
                // No enclosing scope: land here and terminate in phase 2
                if let Some(envelope) = envelope {
                    (*envelope).catch_temp = 0;
                }
                return Disposition::HandlerFound;
            }
        };
        if site.landing_pad == 0 {
            return Disposition::Continue;
        }
        return match check_action_record(&lsda, site.action_record, thrown, Scan::Search) {
            Ok(found) if found.kind == HandlerKind::Catch => {
                if let Some(envelope) = envelope {
                    (*envelope).handler_switch_value = found.selector as c_int;
                    (*envelope).action_record = site.action_record;
                    (*envelope).language_specific_data = lsda_ptr;
                    (*envelope).catch_temp = site.landing_pad;
                    (*envelope).adjusted_ptr = found.adjusted_ptr;
                }
                Disposition::HandlerFound
            }
            Ok(_) => Disposition::Continue,
            Err(err) => {
                warn!("malformed exception table at {lsda_ptr:p}: {err}");
                if let Some(envelope) = envelope {
                    (*envelope).catch_temp = 0;
                }
                Disposition::HandlerFound
            }
        };
    }

    if !actions.contains(UnwindActions::HANDLER_FRAME) {
        return match locate(frame, lsda_ptr) {
            Ok((lsda, Some(site))) if site.landing_pad != 0 => {
                match check_action_record(&lsda, site.action_record, thrown, Scan::CleanupOnly) {
                    Ok(found) if found.kind == HandlerKind::Cleanup => Disposition::Install {
                        landing_pad: site.landing_pad,
                        selector: 0,
                    },
                    Ok(_) => Disposition::Continue,
                    Err(err) => Disposition::Terminate(TerminateReason::MalformedLsda(err)),
                }
            }
            Ok(_) => Disposition::Continue,
            Err(err) => Disposition::Terminate(TerminateReason::MalformedLsda(err)),
        };
    }

    match envelope {
        Some(envelope) if (*envelope).catch_temp == 0 => {
            let reason = match locate(frame, lsda_ptr) {
                Err(err) => TerminateReason::MalformedLsda(err),
                Ok(_) => TerminateReason::UnhandledInCleanup,
            };
            Disposition::Terminate(reason)
        }
        Some(envelope) => {
            let landing_pad = (*envelope).catch_temp;
            let selector = i64::from((*envelope).handler_switch_value);
            (*envelope).catch_temp = 0;
            (*envelope).handler_switch_value = 0;
            Disposition::Install {
                landing_pad,
                selector,
            }
        }
        // Foreign: nothing was cached, so look it up again
        None => match locate(frame, lsda_ptr) {
            Ok((lsda, Some(site))) if site.landing_pad != 0 => {
                match check_action_record(&lsda, site.action_record, None, Scan::Search) {
                    Ok(found) if found.kind != HandlerKind::None => Disposition::Install {
                        landing_pad: site.landing_pad,
                        selector: found.selector,
                    },
                    Ok(_) => Disposition::Terminate(TerminateReason::UnhandledInCleanup),
                    Err(err) => Disposition::Terminate(TerminateReason::MalformedLsda(err)),
                }
            }
            Ok(_) => Disposition::Terminate(TerminateReason::UnhandledInCleanup),
            Err(err) => Disposition::Terminate(TerminateReason::MalformedLsda(err)),
        },
    }
}

/// Runs [`decide_frame`] and applies the result to `frame`.
///
/// # Safety
/// See [`decide_frame`].
pub unsafe fn personality_with<F: FrameContext>(
    version: c_int,
    actions: UnwindActions,
    exception_class: u64,
    header: *mut UnwindException,
    frame: &mut F,
) -> UnwindReasonCode {
    let disposition = decide_frame(version, actions, exception_class, header, frame);
    trace!(
        "personality: ip={:#x} actions={actions:?} -> {disposition:?}",
        frame.call_site_ip()
    );
    match disposition {
        Disposition::Continue => UnwindReasonCode::ContinueUnwind,
        Disposition::HandlerFound => UnwindReasonCode::HandlerFound,
        Disposition::Install {
            landing_pad,
            selector,
        } => {
            frame.set_ip(landing_pad);
            frame.set_gr(UNWIND_DATA_REG.0, header as usize);
            frame.set_gr(UNWIND_DATA_REG.1, selector as usize);
            UnwindReasonCode::InstallContext
        }
        Disposition::Terminate(reason) => terminate_with(reason),
        Disposition::Fatal(code) => code,
    }
}

/// `__gxx_personality_v0`, referenced from the unwind tables of every
/// function with C++ cleanups or handlers.
///
/// # Safety
/// Only the unwinder may call this, with a context for the current frame.
#[cfg_attr(feature = "itanium-abi", export_name = "__gxx_personality_v0")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub unsafe extern "C" fn cxxrt_personality_v0(
    version: c_int,
    actions: c_int,
    exception_class: u64,
    header: *mut UnwindException,
    context: *mut UnwindContext,
) -> UnwindReasonCode {
    let mut frame = SystemFrame::new(context);
    personality_with(
        version,
        UnwindActions::from_bits_retain(actions),
        exception_class,
        header,
        &mut frame,
    )
}
