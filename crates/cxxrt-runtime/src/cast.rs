//! Casts across polymorphic hierarchies and catch-clause matching.

use core::ffi::c_void;
use core::ptr;

use crate::rtti::{ClassTypeInfo, TypeInfo};

/// The two words immediately before a vtable's address point.
#[repr(C)]
struct VtableHeader {
    /// Offset from the sub-object to the most-derived object.
    leaf_offset: isize,
    /// Descriptor of the most-derived object.
    leaf_type: *const ClassTypeInfo,
}

/// Locates the most-derived object containing the polymorphic sub-object
/// at `obj`, and its type.
///
/// # Safety
/// `obj` must point to a live polymorphic object with an ABI vtable.
pub unsafe fn resolve_leaf<'a>(obj: *const c_void) -> (*mut c_void, &'a ClassTypeInfo) {
    let vtable = *obj.cast::<*const VtableHeader>();
    let header = &*vtable.sub(1);
    let leaf = obj.byte_offset(header.leaf_offset).cast_mut();
    (leaf, &*header.leaf_type)
}

/// Implements `dynamic_cast<T*>` for downcasts and cross-casts.
///
/// The most-derived object is found through the vtable header and then
/// searched for a `dst` sub-object. `src` and the offset hint are accepted
/// for ABI compatibility; the search does not need them.
///
/// # Safety
/// `sub` must be null or point to a live polymorphic object.
pub unsafe fn dynamic_cast(
    sub: *const c_void,
    _src: &ClassTypeInfo,
    dst: &ClassTypeInfo,
    _src2dst_offset: isize,
) -> *mut c_void {
    if sub.is_null() {
        return ptr::null_mut();
    }
    let (leaf, leaf_type) = resolve_leaf(sub);
    leaf_type.cast_to(leaf, dst)
}

/// ABI entry point for `dynamic_cast`.
///
/// # Safety
/// See [`dynamic_cast`]; the descriptors must be valid class descriptors.
#[cfg_attr(feature = "itanium-abi", export_name = "__dynamic_cast")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub unsafe extern "C" fn cxxrt_dynamic_cast(
    sub: *const c_void,
    src: *const ClassTypeInfo,
    dst: *const ClassTypeInfo,
    src2dst_offset: isize,
) -> *mut c_void {
    if src.is_null() || dst.is_null() {
        return ptr::null_mut();
    }
    dynamic_cast(sub, &*src, &*dst, src2dst_offset)
}

/// Tests a catch clause against a thrown object.
///
/// `payload` is the address of the thrown value. `catch_type` of `None` is
/// a catch-all. On a match, returns the pointer handed to the catch block:
/// the thrown pointer's value for pointer throws, otherwise the (possibly
/// base-adjusted) object address.
///
/// # Safety
/// `payload` must point to a live value of type `thrown`.
pub unsafe fn match_catch(
    thrown: &TypeInfo,
    payload: *mut c_void,
    catch_type: Option<&TypeInfo>,
) -> Option<*mut c_void> {
    let thrown_pointer = thrown.as_pointer();
    let obj = if thrown_pointer.is_some() {
        *payload.cast::<*mut c_void>()
    } else {
        payload
    };

    let Some(catch_type) = catch_type else {
        return Some(obj);
    };

    let mut ex_type = thrown;
    let mut target = catch_type;
    if let (Some(thrown_pointer), Some(catch_pointer)) = (thrown_pointer, catch_type.as_pointer()) {
        // The handler may add qualifiers, never drop them
        if !catch_pointer
            .qualifiers()
            .contains(thrown_pointer.qualifiers())
        {
            return None;
        }
        if catch_pointer.pointee().is_void() {
            return Some(obj);
        }
        ex_type = thrown_pointer.pointee();
        target = catch_pointer.pointee();
    }

    if target.same_type(ex_type) {
        return Some(obj);
    }

    match (ex_type.as_class(), target.as_class()) {
        (Some(ex_class), Some(target_class)) if ex_class.can_cast_to(target_class) => {
            if obj.is_null() {
                Some(obj)
            } else {
                Some(ex_class.cast_to(obj, target_class))
            }
        }
        _ => None,
    }
}
