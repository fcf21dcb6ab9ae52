//! RTTI (Run-Time Type Information) descriptors.
//!
//! Every type in a compiled program has exactly one descriptor, emitted by
//! the compiler and never mutated. The layouts here match the Itanium C++ ABI
//! so compiler-emitted descriptors can be read in place:
//!
//! - `TypeInfo` - `std::type_info`: vtable pointer and mangled name
//! - `ClassTypeInfo` - a class with no bases
//! - `SiClassTypeInfo` - a class with one public, non-virtual base at offset 0
//! - `VmiClassTypeInfo` - any other class, carrying a list of base records
//! - `PbaseTypeInfo` - pointers and pointers-to-member, with qualifier flags
//!
//! The kind of a descriptor is recovered from its vtable pointer: each kind
//! has its own vtable, owned by this runtime, and compilers point descriptors
//! at it.

use core::ffi::{c_char, c_long, c_uint, c_void, CStr};
use core::fmt;
use core::ptr;

use bitflags::bitflags;

/// Vtable shared by every descriptor of one kind.
///
/// Compilers reference the vtable symbol plus two words (the address point);
/// the slots after it are never called by compiled code.
#[repr(C)]
pub struct TypeInfoVtable {
    offset_to_top: isize,
    type_info: *const c_void,
    complete_dtor: unsafe extern "C" fn(*mut TypeInfo),
    deleting_dtor: unsafe extern "C" fn(*mut TypeInfo),
}

// Vtables are immutable after link time
unsafe impl Sync for TypeInfoVtable {}

unsafe extern "C" fn descriptor_dtor(_: *mut TypeInfo) {}

impl TypeInfoVtable {
    const fn new() -> Self {
        Self {
            offset_to_top: 0,
            type_info: ptr::null(),
            complete_dtor: descriptor_dtor,
            deleting_dtor: descriptor_dtor,
        }
    }

    fn address_point(&'static self) -> *const c_void {
        ptr::addr_of!(self.complete_dtor).cast()
    }
}

macro_rules! descriptor_vtables {
    ($($name:ident => $symbol:literal),* $(,)?) => {
        $(
            #[cfg_attr(feature = "itanium-abi", export_name = $symbol)]
            pub static $name: TypeInfoVtable = TypeInfoVtable::new();
        )*
    };
}

descriptor_vtables! {
    TYPE_INFO_VTABLE => "_ZTVSt9type_info",
    FUNDAMENTAL_VTABLE => "_ZTVN10__cxxabiv123__fundamental_type_infoE",
    ARRAY_VTABLE => "_ZTVN10__cxxabiv117__array_type_infoE",
    FUNCTION_VTABLE => "_ZTVN10__cxxabiv120__function_type_infoE",
    ENUM_VTABLE => "_ZTVN10__cxxabiv116__enum_type_infoE",
    CLASS_VTABLE => "_ZTVN10__cxxabiv117__class_type_infoE",
    SI_CLASS_VTABLE => "_ZTVN10__cxxabiv120__si_class_type_infoE",
    VMI_CLASS_VTABLE => "_ZTVN10__cxxabiv121__vmi_class_type_infoE",
    POINTER_VTABLE => "_ZTVN10__cxxabiv119__pointer_type_infoE",
    POINTER_TO_MEMBER_VTABLE => "_ZTVN10__cxxabiv129__pointer_to_member_type_infoE",
}

/// The descriptor variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Fundamental,
    Array,
    Function,
    Enum,
    Class,
    SiClass,
    VmiClass,
    Pointer,
    PointerToMember,
    /// A vtable this runtime does not own; treated as a leaf type.
    Unknown,
}

impl TypeKind {
    fn vtable(self) -> &'static TypeInfoVtable {
        match self {
            TypeKind::Fundamental => &FUNDAMENTAL_VTABLE,
            TypeKind::Array => &ARRAY_VTABLE,
            TypeKind::Function => &FUNCTION_VTABLE,
            TypeKind::Enum => &ENUM_VTABLE,
            TypeKind::Class => &CLASS_VTABLE,
            TypeKind::SiClass => &SI_CLASS_VTABLE,
            TypeKind::VmiClass => &VMI_CLASS_VTABLE,
            TypeKind::Pointer => &POINTER_VTABLE,
            TypeKind::PointerToMember => &POINTER_TO_MEMBER_VTABLE,
            TypeKind::Unknown => &TYPE_INFO_VTABLE,
        }
    }

    const ALL: [TypeKind; 9] = [
        TypeKind::Fundamental,
        TypeKind::Array,
        TypeKind::Function,
        TypeKind::Enum,
        TypeKind::Class,
        TypeKind::SiClass,
        TypeKind::VmiClass,
        TypeKind::Pointer,
        TypeKind::PointerToMember,
    ];

    fn from_vtable(vtable: *const c_void) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.vtable().address_point() == vtable)
            .unwrap_or(TypeKind::Unknown)
    }

    pub fn is_class(self) -> bool {
        matches!(self, TypeKind::Class | TypeKind::SiClass | TypeKind::VmiClass)
    }

    pub fn is_pointer_like(self) -> bool {
        matches!(self, TypeKind::Pointer | TypeKind::PointerToMember)
    }

    pub fn is_fundamental(self) -> bool {
        self == TypeKind::Fundamental
    }
}

/// `std::type_info`.
#[repr(C)]
pub struct TypeInfo {
    vtable: *const c_void,
    name: *const c_char,
}

unsafe impl Sync for TypeInfo {}
unsafe impl Send for TypeInfo {}

impl TypeInfo {
    fn with_kind(kind: TypeKind, name: &'static CStr) -> Self {
        Self {
            vtable: kind.vtable().address_point(),
            name: name.as_ptr(),
        }
    }

    /// Descriptor for a fundamental type, e.g. `c"i"` for `int`.
    pub fn fundamental(name: &'static CStr) -> Self {
        Self::with_kind(TypeKind::Fundamental, name)
    }

    pub fn array(name: &'static CStr) -> Self {
        Self::with_kind(TypeKind::Array, name)
    }

    pub fn function(name: &'static CStr) -> Self {
        Self::with_kind(TypeKind::Function, name)
    }

    pub fn enumeration(name: &'static CStr) -> Self {
        Self::with_kind(TypeKind::Enum, name)
    }

    pub fn kind(&self) -> TypeKind {
        TypeKind::from_vtable(self.vtable)
    }

    /// The mangled name of this type.
    pub fn name(&self) -> &CStr {
        // SAFETY: descriptors always carry a NUL-terminated name
        unsafe { CStr::from_ptr(self.name) }
    }

    pub fn name_ptr(&self) -> *const c_char {
        self.name
    }

    /// Returns true if both descriptors denote the same type.
    ///
    /// Descriptors are normally unique, but independently linked modules may
    /// each carry a copy, so equal names also count. Names starting with `*`
    /// are local to one module and only compare by address.
    pub fn same_type(&self, other: &TypeInfo) -> bool {
        if ptr::eq(self, other) || self.name == other.name {
            return true;
        }
        let name = self.name().to_bytes();
        name.first() != Some(&b'*') && name == other.name().to_bytes()
    }

    /// Implementation-defined ordering, by address of the name string.
    pub fn before(&self, other: &TypeInfo) -> bool {
        self.name < other.name
    }

    pub fn is_void(&self) -> bool {
        self.kind().is_fundamental() && self.name().to_bytes() == b"v"
    }

    pub fn as_class(&self) -> Option<&ClassTypeInfo> {
        if self.kind().is_class() {
            // SAFETY: every class descriptor starts with a ClassTypeInfo
            Some(unsafe { &*(self as *const TypeInfo).cast::<ClassTypeInfo>() })
        } else {
            None
        }
    }

    /// View as a pointer descriptor. Pointers-to-member are not included:
    /// they only ever match by identity.
    pub fn as_pointer(&self) -> Option<&PbaseTypeInfo> {
        if self.kind() == TypeKind::Pointer {
            // SAFETY: pointer descriptors start with a PbaseTypeInfo
            Some(unsafe { &*(self as *const TypeInfo).cast::<PbaseTypeInfo>() })
        } else {
            None
        }
    }

    pub fn as_pointer_to_member(&self) -> Option<&PointerToMemberTypeInfo> {
        if self.kind() == TypeKind::PointerToMember {
            // SAFETY: checked by kind
            Some(unsafe { &*(self as *const TypeInfo).cast::<PointerToMemberTypeInfo>() })
        } else {
            None
        }
    }
}

impl PartialEq for TypeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.same_type(other)
    }
}

impl Eq for TypeInfo {}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// `__class_type_info`, and the common prefix of the other class kinds.
#[repr(C)]
pub struct ClassTypeInfo {
    pub type_info: TypeInfo,
}

impl ClassTypeInfo {
    /// A class with no bases.
    pub fn new(name: &'static CStr) -> Self {
        Self {
            type_info: TypeInfo::with_kind(TypeKind::Class, name),
        }
    }

    pub fn kind(&self) -> TypeKind {
        self.type_info.kind()
    }

    fn as_si(&self) -> &SiClassTypeInfo {
        // SAFETY: callers check the kind first
        unsafe { &*(self as *const ClassTypeInfo).cast::<SiClassTypeInfo>() }
    }

    fn bases(&self) -> &[BaseClassTypeInfo] {
        let vmi = (self as *const ClassTypeInfo).cast::<VmiClassTypeInfo<0>>();
        // SAFETY: callers check the kind first; base_count records how many
        // entries follow the header
        unsafe {
            let count = (*vmi).base_count as usize;
            let first = ptr::addr_of!((*vmi).base_info).cast::<BaseClassTypeInfo>();
            core::slice::from_raw_parts(first, count)
        }
    }

    /// Returns true if an object of this type has a `target` sub-object.
    ///
    /// Base lists are walked in declaration order and the first path wins;
    /// ambiguous hierarchies are not detected, and base accessibility is
    /// not checked.
    pub fn can_cast_to(&self, target: &ClassTypeInfo) -> bool {
        if self.type_info.same_type(&target.type_info) {
            return true;
        }
        match self.kind() {
            TypeKind::SiClass => self.as_si().base().can_cast_to(target),
            TypeKind::VmiClass => self
                .bases()
                .iter()
                .any(|base| base.base_type().can_cast_to(target)),
            _ => false,
        }
    }

    /// Adjusts `obj`, an object of this type, to its `target` sub-object.
    /// Returns null if there is none.
    ///
    /// # Safety
    /// `obj` must point to a live object of this type; virtual-base offsets
    /// are read through its vtable.
    pub unsafe fn cast_to(&self, obj: *mut c_void, target: &ClassTypeInfo) -> *mut c_void {
        if self.type_info.same_type(&target.type_info) {
            return obj;
        }
        match self.kind() {
            TypeKind::SiClass => self.as_si().base().cast_to(obj, target),
            TypeKind::VmiClass => {
                for base in self.bases() {
                    let cast = obj.byte_offset(base.resolve_offset(obj));
                    let base_type = base.base_type();
                    if base_type.type_info.same_type(&target.type_info) {
                        return cast;
                    }
                    let found = base_type.cast_to(cast, target);
                    if !found.is_null() {
                        return found;
                    }
                }
                ptr::null_mut()
            }
            _ => ptr::null_mut(),
        }
    }
}

impl fmt::Debug for ClassTypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.type_info.fmt(f)
    }
}

/// `__si_class_type_info`.
#[repr(C)]
pub struct SiClassTypeInfo {
    pub class: ClassTypeInfo,
    base_type: *const ClassTypeInfo,
}

impl SiClassTypeInfo {
    pub fn new(name: &'static CStr, base: &ClassTypeInfo) -> Self {
        Self {
            class: ClassTypeInfo {
                type_info: TypeInfo::with_kind(TypeKind::SiClass, name),
            },
            base_type: base,
        }
    }

    pub fn base(&self) -> &ClassTypeInfo {
        // SAFETY: the base descriptor outlives every descriptor naming it
        unsafe { &*self.base_type }
    }
}

bitflags! {
    /// Flags in the low byte of a base record's `offset_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BaseFlags: c_long {
        const VIRTUAL = 0x1;
        const PUBLIC = 0x2;
    }
}

const OFFSET_SHIFT: u32 = 8;

/// `__base_class_type_info`: one entry in a VMI base list.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BaseClassTypeInfo {
    base_type: *const ClassTypeInfo,
    offset_flags: c_long,
}

impl BaseClassTypeInfo {
    /// For a non-virtual base `offset` is the displacement of the base
    /// sub-object; for a virtual base it is the (negative) displacement
    /// within the vtable of the slot holding that displacement.
    pub fn new(base: &ClassTypeInfo, offset: isize, flags: BaseFlags) -> Self {
        Self {
            base_type: base,
            offset_flags: ((offset as c_long) << OFFSET_SHIFT) | flags.bits(),
        }
    }

    pub fn base_type(&self) -> &ClassTypeInfo {
        // SAFETY: the base descriptor outlives every descriptor naming it
        unsafe { &*self.base_type }
    }

    pub fn offset(&self) -> isize {
        (self.offset_flags >> OFFSET_SHIFT) as isize
    }

    pub fn flags(&self) -> BaseFlags {
        BaseFlags::from_bits_retain(self.offset_flags & ((1 << OFFSET_SHIFT) - 1))
    }

    pub fn is_virtual(&self) -> bool {
        self.flags().contains(BaseFlags::VIRTUAL)
    }

    pub fn is_public(&self) -> bool {
        self.flags().contains(BaseFlags::PUBLIC)
    }

    /// Byte displacement from `obj` to this base sub-object.
    ///
    /// # Safety
    /// For virtual bases `obj` must point at a live object whose first word
    /// is its vtable pointer.
    pub unsafe fn resolve_offset(&self, obj: *const c_void) -> isize {
        if !self.is_virtual() {
            return self.offset();
        }
        let vtable = *obj.cast::<*const u8>();
        *vtable.offset(self.offset()).cast::<isize>()
    }
}

bitflags! {
    /// `__vmi_class_type_info::__flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmiFlags: c_uint {
        const NON_DIAMOND_REPEAT = 0x1;
        const DIAMOND_SHAPED = 0x2;
    }
}

/// `__vmi_class_type_info` with `N` base records.
///
/// Compiler-emitted descriptors have however many bases the class declares;
/// `base_count` is authoritative and `N` only sizes Rust-built instances.
#[repr(C)]
pub struct VmiClassTypeInfo<const N: usize> {
    pub class: ClassTypeInfo,
    flags: c_uint,
    base_count: c_uint,
    base_info: [BaseClassTypeInfo; N],
}

impl<const N: usize> VmiClassTypeInfo<N> {
    pub fn new(name: &'static CStr, flags: VmiFlags, bases: [BaseClassTypeInfo; N]) -> Self {
        Self {
            class: ClassTypeInfo {
                type_info: TypeInfo::with_kind(TypeKind::VmiClass, name),
            },
            flags: flags.bits(),
            base_count: N as c_uint,
            base_info: bases,
        }
    }

    pub fn flags(&self) -> VmiFlags {
        VmiFlags::from_bits_retain(self.flags)
    }

    pub fn bases(&self) -> &[BaseClassTypeInfo] {
        self.class.bases()
    }
}

bitflags! {
    /// Qualifiers on a pointer's pointee.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Qualifiers: c_uint {
        const CONST = 0x1;
        const VOLATILE = 0x2;
        const RESTRICT = 0x4;
        const INCOMPLETE = 0x8;
        const INCOMPLETE_CLASS = 0x10;
    }
}

/// `__pbase_type_info`: shared prefix of pointer descriptors.
#[repr(C)]
pub struct PbaseTypeInfo {
    pub type_info: TypeInfo,
    flags: c_uint,
    pointee: *const TypeInfo,
}

impl PbaseTypeInfo {
    /// Descriptor for a pointer to `pointee`.
    pub fn pointer(name: &'static CStr, qualifiers: Qualifiers, pointee: &TypeInfo) -> Self {
        Self {
            type_info: TypeInfo::with_kind(TypeKind::Pointer, name),
            flags: qualifiers.bits(),
            pointee,
        }
    }

    pub fn qualifiers(&self) -> Qualifiers {
        Qualifiers::from_bits_retain(self.flags)
    }

    pub fn pointee(&self) -> &TypeInfo {
        // SAFETY: the pointee descriptor outlives the pointer descriptor
        unsafe { &*self.pointee }
    }
}

/// `__pointer_to_member_type_info`.
#[repr(C)]
pub struct PointerToMemberTypeInfo {
    pub pbase: PbaseTypeInfo,
    context: *const ClassTypeInfo,
}

impl PointerToMemberTypeInfo {
    pub fn new(
        name: &'static CStr,
        qualifiers: Qualifiers,
        pointee: &TypeInfo,
        context: &ClassTypeInfo,
    ) -> Self {
        Self {
            pbase: PbaseTypeInfo {
                type_info: TypeInfo::with_kind(TypeKind::PointerToMember, name),
                flags: qualifiers.bits(),
                pointee,
            },
            context,
        }
    }

    /// The class whose member this points to.
    pub fn context(&self) -> &ClassTypeInfo {
        // SAFETY: the class descriptor outlives this one
        unsafe { &*self.context }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Object {
        vptr: *const isize,
        body: [u64; 8],
    }

    impl Object {
        fn new(vptr: *const isize) -> Self {
            Object { vptr, body: [0; 8] }
        }

        fn addr(&mut self) -> *mut c_void {
            (self as *mut Object).cast()
        }
    }

    #[test]
    fn test_kinds() {
        let int = TypeInfo::fundamental(c"i");
        let class = ClassTypeInfo::new(c"3Foo");
        let ptr = PbaseTypeInfo::pointer(c"Pi", Qualifiers::empty(), &int);

        assert_eq!(int.kind(), TypeKind::Fundamental);
        assert_eq!(class.kind(), TypeKind::Class);
        assert_eq!(ptr.type_info.kind(), TypeKind::Pointer);
        assert!(int.as_class().is_none());
        assert!(class.type_info.as_class().is_some());
        assert!(ptr.type_info.as_pointer().is_some());
        assert_eq!(TypeInfo::enumeration(c"1E").kind(), TypeKind::Enum);
    }

    #[test]
    fn test_same_type_by_name() {
        let a = TypeInfo::fundamental(c"i");
        let b = TypeInfo::fundamental(c"i");
        let c = TypeInfo::fundamental(c"f");

        assert!(a.same_type(&a));
        assert!(a.same_type(&b));
        assert!(!a.same_type(&c));
        assert_eq!(a, b);
    }

    #[test]
    fn test_local_names_compare_by_address() {
        let a = ClassTypeInfo::new(c"*N12_GLOBAL__N_14LocalE");
        let b = ClassTypeInfo::new(c"*N12_GLOBAL__N_14LocalE");

        assert!(a.type_info.same_type(&a.type_info));
        assert!(!a.type_info.same_type(&b.type_info));
    }

    #[test]
    fn test_before_is_antisymmetric() {
        let a = TypeInfo::fundamental(c"i");
        let b = TypeInfo::fundamental(c"d");
        assert_ne!(a.before(&b), b.before(&a));
    }

    #[test]
    fn test_leaf_class_casts_only_to_itself() {
        let foo = ClassTypeInfo::new(c"3Foo");
        let bar = ClassTypeInfo::new(c"3Bar");
        let mut obj = Object::new(ptr::null());

        assert!(foo.can_cast_to(&foo));
        assert!(!foo.can_cast_to(&bar));
        unsafe {
            assert_eq!(foo.cast_to(obj.addr(), &foo), obj.addr());
            assert!(foo.cast_to(obj.addr(), &bar).is_null());
        }
    }

    #[test]
    fn test_single_inheritance_chain() {
        let base = ClassTypeInfo::new(c"4Base");
        let mid = SiClassTypeInfo::new(c"3Mid", &base);
        let leaf = SiClassTypeInfo::new(c"4Leaf", &mid.class);
        let other = ClassTypeInfo::new(c"5Other");
        let mut obj = Object::new(ptr::null());

        assert!(leaf.class.can_cast_to(&base));
        assert!(!base.can_cast_to(&leaf.class));
        unsafe {
            assert_eq!(leaf.class.cast_to(obj.addr(), &base), obj.addr());
            assert!(leaf.class.cast_to(obj.addr(), &other).is_null());
        }
    }

    #[test]
    fn test_multiple_inheritance_offsets() {
        let left = ClassTypeInfo::new(c"4Left");
        let right = ClassTypeInfo::new(c"5Right");
        let derived = VmiClassTypeInfo::new(
            c"7Derived",
            VmiFlags::empty(),
            [
                BaseClassTypeInfo::new(&left, 0, BaseFlags::PUBLIC),
                BaseClassTypeInfo::new(&right, 16, BaseFlags::PUBLIC),
            ],
        );
        let unrelated = ClassTypeInfo::new(c"9Unrelated");
        let mut obj = Object::new(ptr::null());
        let base = obj.addr();

        assert_eq!(derived.bases().len(), 2);
        assert!(derived.bases()[1].is_public());
        assert!(!derived.bases()[1].is_virtual());
        assert!(derived.class.can_cast_to(&right));
        unsafe {
            assert_eq!(derived.class.cast_to(base, &left), base);
            assert_eq!(derived.class.cast_to(base, &right), base.byte_add(16));
            assert!(derived.class.cast_to(base, &unrelated).is_null());
        }
    }

    #[test]
    fn test_virtual_base_offset_is_read_from_vtable() {
        let vbase = ClassTypeInfo::new(c"5VBase");
        let derived = VmiClassTypeInfo::new(
            c"7Derived",
            VmiFlags::empty(),
            [BaseClassTypeInfo::new(
                &vbase,
                -24,
                BaseFlags::VIRTUAL | BaseFlags::PUBLIC,
            )],
        );
        // [vbase offset, offset to top, rtti, <address point>]
        let vtable: [isize; 4] = [40, 0, 0, 0];
        let mut obj = Object::new(vtable[3..].as_ptr());
        let base = obj.addr();

        assert_eq!(derived.bases()[0].offset(), -24);
        unsafe {
            assert_eq!(derived.bases()[0].resolve_offset(base), 40);
            assert_eq!(derived.class.cast_to(base, &vbase), base.byte_add(40));
        }
    }

    #[test]
    fn test_first_match_wins_for_repeated_base() {
        let shared = ClassTypeInfo::new(c"6Shared");
        let a = SiClassTypeInfo::new(c"1A", &shared);
        let b = SiClassTypeInfo::new(c"1B", &shared);
        let diamond = VmiClassTypeInfo::new(
            c"7Diamond",
            VmiFlags::NON_DIAMOND_REPEAT,
            [
                BaseClassTypeInfo::new(&a.class, 8, BaseFlags::PUBLIC),
                BaseClassTypeInfo::new(&b.class, 24, BaseFlags::PUBLIC),
            ],
        );
        let mut obj = Object::new(ptr::null());
        let base = obj.addr();

        unsafe {
            assert_eq!(diamond.class.cast_to(base, &shared), base.byte_add(8));
        }
    }

    #[test]
    fn test_pointer_to_member_context() {
        let int = TypeInfo::fundamental(c"i");
        let class = ClassTypeInfo::new(c"3Foo");
        let ptm = PointerToMemberTypeInfo::new(c"M3Fooi", Qualifiers::CONST, &int, &class);

        let view = ptm.pbase.type_info.as_pointer_to_member().unwrap();
        assert!(view.context().type_info.same_type(&class.type_info));
        assert!(view.pbase.pointee().same_type(&int));
        assert!(ptm.pbase.type_info.as_pointer().is_none());
        assert!(ptm.pbase.type_info.kind().is_pointer_like());
    }
}
