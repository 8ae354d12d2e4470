//! The type lattice shared by every stage of translation.
//!
//! Types are interned into a `TypeArena`: structurally equal types always receive the same
//! `TypeId`, so comparing ids is comparing types. Supertype edges are stored as ids, which lets
//! the arena represent cyclic hierarchies; every walk over them carries a visited set.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;

use rustc_hash::FxHashMap;

use crate::config::Config;
use crate::error::{Error, GeneralResult};

#[cfg(test)]
use quickcheck::{quickcheck, TestResult};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Width {
    W32,
    W64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Boolean,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

/// How a value is held on the JVM operand stack.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StackKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl StackKind {
    pub fn category(self) -> u8 {
        use StackKind::*;
        match self {
            Long | Double               => 2,
            Int | Float | Reference     => 1,
        }
    }
}

impl PrimitiveKind {
    pub fn width(self) -> Width {
        use PrimitiveKind::*;
        match self {
            Int64 | UInt64 | Float64 => Width::W64,
            _ => Width::W32,
        }
    }

    pub fn stack_kind(self) -> StackKind {
        use PrimitiveKind::*;
        match self {
            Boolean | Char | Int8 | UInt8 | Int16 | UInt16 | Int32 | UInt32 => StackKind::Int,
            Int64 | UInt64  => StackKind::Long,
            Float32         => StackKind::Float,
            Float64         => StackKind::Double,
        }
    }

    pub fn is_unsigned(self) -> bool {
        use PrimitiveKind::*;
        match self {
            Boolean | Char | UInt8 | UInt16 | UInt32 | UInt64 => true,
            _ => false,
        }
    }

    pub fn descriptor(self) -> char {
        use PrimitiveKind::*;
        match self {
            Boolean         => 'Z',
            Char            => 'C',
            Int8  | UInt8   => 'B',
            Int16 | UInt16  => 'S',
            Int32 | UInt32  => 'I',
            Int64 | UInt64  => 'J',
            Float32         => 'F',
            Float64         => 'D',
        }
    }

    /// wrapper class and its unboxing accessor
    pub fn wrapper(self) -> (&'static str, &'static str) {
        use PrimitiveKind::*;
        match self {
            Boolean         => ("java/lang/Boolean"  , "booleanValue"),
            Char            => ("java/lang/Character", "charValue"   ),
            Int8  | UInt8   => ("java/lang/Byte"     , "byteValue"   ),
            Int16 | UInt16  => ("java/lang/Short"    , "shortValue"  ),
            Int32 | UInt32  => ("java/lang/Integer"  , "intValue"    ),
            Int64 | UInt64  => ("java/lang/Long"     , "longValue"   ),
            Float32         => ("java/lang/Float"    , "floatValue"  ),
            Float64         => ("java/lang/Double"   , "doubleValue" ),
        }
    }

    /// operand of the `newarray` instruction
    pub fn array_code(self) -> u8 {
        use PrimitiveKind::*;
        match self {
            Boolean         => 4,
            Char            => 5,
            Float32         => 6,
            Float64         => 7,
            Int8  | UInt8   => 8,
            Int16 | UInt16  => 9,
            Int32 | UInt32  => 10,
            Int64 | UInt64  => 11,
        }
    }

    fn name(self) -> &'static str {
        use PrimitiveKind::*;
        match self {
            Boolean => "bool",
            Char    => "char",
            Int8    => "int8",
            UInt8   => "uint8",
            Int16   => "int16",
            UInt16  => "uint16",
            Int32   => "int32",
            UInt32  => "uint32",
            Int64   => "int64",
            UInt64  => "uint64",
            Float32 => "float32",
            Float64 => "float64",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GenericRole {
    /// bound to a concrete type argument before translation
    Resolved,
    /// only known at run time
    Unresolved,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Primitive,
    Value,
    Reference,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClassKind {
    Class,
    Interface,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AbstractType {
    Primitive(PrimitiveKind),
    Reference(String),
    /// `element` is never itself an array
    Array { element : TypeId, rank : u8 },
    Value(String),
    GenericParameter { name : String, role : GenericRole },
    Boxed { unboxed : TypeId, by_ref : bool },
    Null,
    UninitializedThis,
    Top,
}

#[derive(Clone, Debug)]
struct ClassInfo {
    kind : ClassKind,
    supertypes : Vec<TypeId>,
}

#[derive(Clone, Debug)]
pub struct TypeArena {
    types : Vec<AbstractType>,
    interned : FxHashMap<AbstractType, TypeId>,
    classes : FxHashMap<TypeId, ClassInfo>,
    object : TypeId,
    throwable : TypeId,
    root : Option<TypeId>,
    cell_class : String,
}

impl TypeArena {
    pub fn new(config : &Config) -> TypeArena {
        let mut arena = TypeArena {
            types : Vec::new(),
            interned : FxHashMap::default(),
            classes : FxHashMap::default(),
            object : TypeId(0),
            throwable : TypeId(0),
            root : None,
            cell_class : config.reference_cell_class.clone(),
        };

        let object = arena.reference(&config.object_class);
        arena.object = object;
        arena.classes.insert(object, ClassInfo { kind : ClassKind::Class, supertypes : Vec::new() });

        let throwable = arena.declare_class(&config.throwable_class, None, &[]);
        arena.throwable = throwable;
        if let Some(root) = &config.exception_root {
            if root != &config.throwable_class {
                arena.root = Some(arena.declare_class(root, Some(throwable), &[]));
            }
        }
        arena.declare_class(&config.string_class, None, &[]);
        arena.declare_class(&config.leave_sentinel.class, Some(throwable), &[]);

        arena
    }

    pub fn intern(&mut self, t : AbstractType) -> TypeId {
        if let Some(&id) = self.interned.get(&t) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(t.clone());
        self.interned.insert(t, id);
        id
    }

    pub fn lookup(&self, t : &AbstractType) -> Option<TypeId> {
        self.interned.get(t).copied()
    }

    pub fn get(&self, id : TypeId) -> &AbstractType {
        &self.types[id.0 as usize]
    }

    pub fn len(&self) -> usize { self.types.len() }
    pub fn is_empty(&self) -> bool { self.types.is_empty() }

    pub fn object(&self) -> TypeId { self.object }
    pub fn throwable(&self) -> TypeId { self.throwable }
    pub fn exception_root(&self) -> Option<TypeId> { self.root }

    pub fn top(&mut self) -> TypeId { self.intern(AbstractType::Top) }
    pub fn null(&mut self) -> TypeId { self.intern(AbstractType::Null) }
    pub fn uninitialized_this(&mut self) -> TypeId { self.intern(AbstractType::UninitializedThis) }
    pub fn primitive(&mut self, kind : PrimitiveKind) -> TypeId { self.intern(AbstractType::Primitive(kind)) }
    pub fn reference(&mut self, name : &str) -> TypeId { self.intern(AbstractType::Reference(name.to_owned())) }
    pub fn value(&mut self, name : &str) -> TypeId { self.intern(AbstractType::Value(name.to_owned())) }

    pub fn generic(&mut self, name : &str, role : GenericRole) -> TypeId {
        self.intern(AbstractType::GenericParameter { name : name.to_owned(), role })
    }

    pub fn boxed(&mut self, unboxed : TypeId, by_ref : bool) -> TypeId {
        self.intern(AbstractType::Boxed { unboxed, by_ref })
    }

    pub fn array(&mut self, element : TypeId, rank : u8) -> TypeId {
        let nested = match *self.get(element) {
            AbstractType::Array { element : inner, rank : r } => Some((inner, r)),
            _ => None,
        };
        match nested {
            Some((inner, r)) => self.intern(AbstractType::Array { element : inner, rank : r.saturating_add(rank) }),
            None => self.intern(AbstractType::Array { element, rank }),
        }
    }

    /// the type of one element of an array type
    pub fn element_of(&mut self, array : TypeId) -> GeneralResult<TypeId> {
        let parts = match *self.get(array) {
            AbstractType::Array { element, rank } => Some((element, rank)),
            _ => None,
        };
        match parts {
            Some((element, 1)) => Ok(element),
            Some((element, rank)) => Ok(self.array(element, rank - 1)),
            None => Err(Error::malformed(format!("{} is not an array", self.describe(array)))),
        }
    }

    /// Records the supertypes of a class. `base` defaults to the universal object type.
    pub fn declare_class(&mut self, name : &str, base : Option<TypeId>, interfaces : &[TypeId]) -> TypeId {
        let id = self.reference(name);
        let mut supertypes = vec![ base.unwrap_or(self.object) ];
        supertypes.extend_from_slice(interfaces);
        self.classes.insert(id, ClassInfo { kind : ClassKind::Class, supertypes });
        id
    }

    pub fn declare_interface(&mut self, name : &str, bases : &[TypeId]) -> TypeId {
        let id = self.reference(name);
        self.classes.insert(id, ClassInfo { kind : ClassKind::Interface, supertypes : bases.to_vec() });
        id
    }

    pub fn declare_value(&mut self, name : &str, interfaces : &[TypeId]) -> TypeId {
        let id = self.value(name);
        self.classes.insert(id, ClassInfo { kind : ClassKind::Class, supertypes : interfaces.to_vec() });
        id
    }

    pub fn is_interface(&self, t : TypeId) -> bool {
        self.classes.get(&t).map(|c| c.kind == ClassKind::Interface).unwrap_or(false)
    }

    pub fn category(&self, t : TypeId) -> u8 {
        match self.get(t) {
            AbstractType::Primitive(k) if k.width() == Width::W64 => 2,
            _ => 1,
        }
    }

    pub fn is_reference(&self, t : TypeId) -> bool {
        use AbstractType::*;
        match self.get(t) {
            Reference(_) | Array { .. } | Boxed { .. } | Null | GenericParameter { .. } | UninitializedThis => true,
            Primitive(_) | Value(_) | Top => false,
        }
    }

    pub fn is_value(&self, t : TypeId) -> bool {
        match self.get(t) {
            AbstractType::Value(_) => true,
            _ => false,
        }
    }

    pub fn is_top(&self, t : TypeId) -> bool { self.get(t) == &AbstractType::Top }

    pub fn value_kind(&self, t : TypeId) -> ValueKind {
        match self.get(t) {
            AbstractType::Primitive(_) => ValueKind::Primitive,
            AbstractType::Value(_) => ValueKind::Value,
            _ => ValueKind::Reference,
        }
    }

    pub fn primitive_kind(&self, t : TypeId) -> Option<PrimitiveKind> {
        match *self.get(t) {
            AbstractType::Primitive(k) => Some(k),
            _ => None,
        }
    }

    pub fn stack_kind(&self, t : TypeId) -> GeneralResult<StackKind> {
        match self.get(t) {
            AbstractType::Primitive(k) => Ok(k.stack_kind()),
            AbstractType::Top => Err(Error::internal("an unset slot has no stack kind")),
            _ => Ok(StackKind::Reference),
        }
    }

    /// The class whose hierarchy a reference-like type answers to.
    fn class_of(&self, t : TypeId) -> TypeId {
        match *self.get(t) {
            AbstractType::Boxed { unboxed, by_ref : false } => match *self.get(unboxed) {
                AbstractType::Primitive(k) =>
                    self.lookup(&AbstractType::Reference(k.wrapper().0.to_owned())).unwrap_or(t),
                AbstractType::Value(_) => unboxed,
                _ => unboxed,
            },
            _ => t,
        }
    }

    /// Breadth-first distances to every reachable supertype, the type itself included.
    fn ancestors(&self, t : TypeId) -> FxHashMap<TypeId, u32> {
        let mut seen = FxHashMap::default();
        let mut queue = VecDeque::new();
        queue.push_back((self.class_of(t), 0));
        while let Some((id, dist)) = queue.pop_front() {
            if seen.contains_key(&id) {
                continue;
            }
            seen.insert(id, dist);
            // the exception root may be a shim over the host hierarchy that points back down
            if Some(id) == self.root {
                continue;
            }
            if let Some(info) = self.classes.get(&id) {
                queue.extend(info.supertypes.iter().map(|&s| (s, dist + 1)));
            }
        }
        seen
    }

    pub fn assignable_to(&self, a : TypeId, b : TypeId) -> bool {
        use AbstractType::*;

        if a == b || self.is_top(b) {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (Primitive(x), Primitive(y)) => x.stack_kind() == y.stack_kind(),
            (Value(_), _) | (_, Value(_)) => false,
            (UninitializedThis, _) | (_, UninitializedThis) => false,
            (Null, _) => self.is_reference(b),
            _ if b == self.object => self.is_reference(a),
            (Array { element : ea, rank : ra }, Array { element : eb, rank : rb }) =>
                if ra == rb {
                    if self.is_reference(*ea) && self.is_reference(*eb) {
                        self.assignable_to(*ea, *eb)
                    } else {
                        ea == eb
                    }
                } else {
                    ra > rb && *eb == self.object
                },
            (Array { .. }, _) | (_, Array { .. }) => false,
            (GenericParameter { .. }, _) | (_, GenericParameter { .. }) => false,
            _ if self.is_reference(a) && self.is_reference(b) =>
                self.ancestors(a).contains_key(&self.class_of(b)),
            _ => false,
        }
    }

    fn tie_break(&self, l : &(u32, TypeId), r : &(u32, TypeId)) -> Ordering {
        let rank = |t| match self.classes.get(&t).map(|c| c.kind) {
            Some(ClassKind::Class)      => 0,
            Some(ClassKind::Interface)  => 1,
            None                        => 2,
        };
        l.0.cmp(&r.0)
            .then_with(|| rank(l.1).cmp(&rank(r.1)))
            .then_with(|| self.describe(l.1).cmp(&self.describe(r.1)))
            .then_with(|| l.1.cmp(&r.1))
    }

    /// Nearest type reachable from both `a` and `b`, falling back to the universal object type.
    /// The choice does not depend on argument order.
    pub fn common_supertype(&mut self, a : TypeId, b : TypeId) -> TypeId {
        use AbstractType::*;

        if a == b {
            return a;
        }
        match (self.get(a).clone(), self.get(b).clone()) {
            (Null, _) if self.is_reference(b) => return b,
            (_, Null) if self.is_reference(a) => return a,
            (Array { element : ea, rank : ra }, Array { element : eb, rank : rb }) => {
                if ra == rb && self.is_reference(ea) && self.is_reference(eb) {
                    let element = self.common_supertype(ea, eb);
                    return self.array(element, ra);
                }
                return self.object;
            },
            (Array { .. }, _) | (_, Array { .. }) => return self.object,
            _ => {},
        }

        let da = self.ancestors(a);
        let db = self.ancestors(b);
        let object = self.object;
        da.iter()
            .filter(|(id, _)| **id != object)
            .filter_map(|(id, x)| db.get(id).map(|y| (x + y, *id)))
            .min_by(|l, r| self.tie_break(l, r))
            .map(|(_, id)| id)
            .unwrap_or(object)
    }

    /// Least upper bound used by frame merges; conflicts that have no common type yield `Top`.
    pub fn join(&mut self, a : TypeId, b : TypeId) -> TypeId {
        use AbstractType::*;

        if a == b {
            return a;
        }
        match (self.get(a).clone(), self.get(b).clone()) {
            (Top, _) | (_, Top) => self.top(),
            (Primitive(x), Primitive(y)) => {
                match (x.stack_kind(), y.stack_kind()) {
                    (StackKind::Int   , StackKind::Int   ) => self.primitive(PrimitiveKind::Int32),
                    (StackKind::Long  , StackKind::Long  ) => self.primitive(PrimitiveKind::Int64),
                    _ => self.top(),
                }
            },
            (UninitializedThis, _) | (_, UninitializedThis) => self.top(),
            _ if self.is_reference(a) && self.is_reference(b) => self.common_supertype(a, b),
            _ => self.top(),
        }
    }

    pub fn descriptor(&self, t : TypeId) -> GeneralResult<String> {
        use AbstractType::*;
        Ok(match self.get(t) {
            Primitive(k) => k.descriptor().to_string(),
            Reference(name) | Value(name) => format!("L{};", name),
            Array { element, rank } =>
                format!("{}{}", "[".repeat(usize::from(*rank)), self.descriptor(*element)?),
            GenericParameter { .. } | Null => self.descriptor(self.object)?,
            Boxed { by_ref : true, .. } => format!("L{};", self.cell_class),
            Boxed { unboxed, by_ref : false } => match self.get(*unboxed) {
                Primitive(k) => format!("L{};", k.wrapper().0),
                _ => self.descriptor(*unboxed)?,
            },
            UninitializedThis | Top =>
                return Err(Error::internal(format!("{} has no descriptor", self.describe(t)))),
        })
    }

    /// Internal name as used by class constants.
    pub fn class_name(&self, t : TypeId) -> GeneralResult<String> {
        use AbstractType::*;
        match self.get(t) {
            Reference(name) | Value(name) => Ok(name.clone()),
            Array { .. } => self.descriptor(t),
            GenericParameter { .. } | Null => self.class_name(self.object),
            Boxed { by_ref : true, .. } => Ok(self.cell_class.clone()),
            Boxed { unboxed, by_ref : false } => match self.get(*unboxed) {
                Primitive(k) => Ok(k.wrapper().0.to_owned()),
                _ => self.class_name(*unboxed),
            },
            Primitive(_) | UninitializedThis | Top =>
                Err(Error::internal(format!("{} is not a class", self.describe(t)))),
        }
    }

    pub fn describe(&self, t : TypeId) -> String {
        use AbstractType::*;
        match self.get(t) {
            Primitive(k) => k.name().to_owned(),
            Reference(name) => name.clone(),
            Value(name) => format!("valuetype {}", name),
            Array { element, rank } => format!("{}{}", self.describe(*element), "[]".repeat(usize::from(*rank))),
            GenericParameter { name, .. } => format!("!{}", name),
            Boxed { unboxed, by_ref : false } => format!("boxed {}", self.describe(*unboxed)),
            Boxed { unboxed, by_ref : true } => format!("{}&", self.describe(*unboxed)),
            Null => "null".to_owned(),
            UninitializedThis => "uninitializedThis".to_owned(),
            Top => "top".to_owned(),
        }
    }
}

#[cfg(test)]
fn arena() -> TypeArena { TypeArena::new(&Config::default()) }

#[test]
fn test_interning_is_identity() {
    let mut types = arena();
    let a = types.reference("demo/Shape");
    let b = types.reference("demo/Shape");
    assert_eq!(a, b);
    let int = types.primitive(PrimitiveKind::Int32);
    let arr1 = types.array(int, 1);
    let arr2 = types.array(arr1, 1);
    assert_eq!(arr2, types.array(int, 2));
    assert_ne!(types.value("demo/Shape"), a);
}

#[test]
fn test_categories() {
    let mut types = arena();
    assert_eq!(types.category(types.object()), 1);
    let long = types.primitive(PrimitiveKind::Int64);
    let double = types.primitive(PrimitiveKind::Float64);
    let flt = types.primitive(PrimitiveKind::Float32);
    assert_eq!(types.category(long), 2);
    assert_eq!(types.category(double), 2);
    assert_eq!(types.category(flt), 1);
}

#[test]
fn test_ternary_merge_finds_interface() {
    let mut types = arena();
    let shape = types.declare_interface("demo/IShape", &[]);
    let circle = types.declare_class("demo/Circle", None, &[shape]);
    let square = types.declare_class("demo/Square", None, &[shape]);
    assert_eq!(types.common_supertype(circle, square), shape);
    assert_eq!(types.common_supertype(square, circle), shape);
    assert!(types.assignable_to(circle, shape));
    assert!(!types.assignable_to(shape, circle));
}

#[test]
fn test_class_preferred_over_interface() {
    let mut types = arena();
    let shape = types.declare_interface("demo/IShape", &[]);
    let base = types.declare_class("demo/Base", None, &[]);
    let a = types.declare_class("demo/A", Some(base), &[shape]);
    let b = types.declare_class("demo/B", Some(base), &[shape]);
    assert_eq!(types.common_supertype(a, b), base);
    assert_eq!(types.common_supertype(b, a), base);
}

#[test]
fn test_unrelated_falls_back_to_object() {
    let mut types = arena();
    let a = types.declare_class("demo/A", None, &[]);
    let b = types.declare_class("demo/B", None, &[]);
    assert_eq!(types.common_supertype(a, b), types.object());
    let undeclared = types.reference("demo/Unknown");
    assert_eq!(types.common_supertype(a, undeclared), types.object());
}

#[test]
fn test_cyclic_hierarchy_terminates() {
    let mut types = arena();
    let a = types.reference("demo/A");
    let b = types.declare_class("demo/B", Some(a), &[]);
    types.declare_class("demo/A", Some(b), &[]);
    let c = types.declare_class("demo/C", Some(a), &[]);
    let merged = types.common_supertype(b, c);
    assert!(merged == a || merged == b);
    assert_eq!(merged, types.common_supertype(c, b));
}

#[test]
fn test_walk_stops_at_exception_root() {
    let mut types = arena();
    let root = types.exception_root().unwrap();
    let throwable = types.throwable();
    // a shim that makes the host root look like a source exception
    types.declare_class("java/lang/Throwable", Some(root), &[]);
    let io = types.declare_class("demo/IOException", Some(root), &[]);
    let arg = types.declare_class("demo/ArgumentException", Some(root), &[]);
    assert_eq!(types.common_supertype(io, arg), root);
    assert_eq!(types.common_supertype(io, throwable), root);
}

#[test]
fn test_values_never_assignable_to_references() {
    let mut types = arena();
    let point = types.declare_value("demo/Point", &[]);
    let object = types.object();
    assert!(!types.assignable_to(point, object));
    let boxed = types.boxed(point, false);
    assert_ne!(boxed, point);
    assert!(types.assignable_to(boxed, object));
    assert!(types.is_value(point));
    assert!(!types.is_reference(point));
    assert_eq!(types.join(point, object), types.top());
}

#[test]
fn test_join_of_int_likes() {
    let mut types = arena();
    let b = types.primitive(PrimitiveKind::Boolean);
    let c = types.primitive(PrimitiveKind::Char);
    let i = types.primitive(PrimitiveKind::Int32);
    let f = types.primitive(PrimitiveKind::Float32);
    assert_eq!(types.join(b, c), i);
    assert_eq!(types.join(i, f), types.top());
}

#[test]
fn test_array_merge() -> GeneralResult<()> {
    let mut types = arena();
    let shape = types.declare_interface("demo/IShape", &[]);
    let circle = types.declare_class("demo/Circle", None, &[shape]);
    let square = types.declare_class("demo/Square", None, &[shape]);
    let ca = types.array(circle, 1);
    let sa = types.array(square, 1);
    let merged = types.common_supertype(ca, sa);
    assert_eq!(merged, types.array(shape, 1));
    assert_eq!(types.descriptor(merged)?, "[Ldemo/IShape;");
    let int = types.primitive(PrimitiveKind::Int32);
    let ia = types.array(int, 1);
    assert_eq!(types.common_supertype(ia, ca), types.object());
    let grid = types.array(int, 2);
    assert_eq!(types.element_of(grid)?, ia);
    Ok(())
}

#[test]
fn test_descriptors() -> GeneralResult<()> {
    let mut types = arena();
    let int = types.primitive(PrimitiveKind::Int32);
    let boxed = types.boxed(int, false);
    assert_eq!(types.descriptor(boxed)?, "Ljava/lang/Integer;");
    assert_eq!(types.class_name(boxed)?, "java/lang/Integer");
    let cell = types.boxed(int, true);
    assert_eq!(types.descriptor(cell)?, "Lsystem/Reference;");
    let t = types.generic("T", GenericRole::Unresolved);
    assert_eq!(types.descriptor(t)?, "Ljava/lang/Object;");
    let top = types.top();
    assert!(types.descriptor(top).is_err());
    Ok(())
}

#[cfg(test)]
quickcheck! {
    fn test_common_supertype_symmetric(edges : Vec<(u8, u8)>, a : u8, b : u8) -> TestResult {
        const N : u8 = 8;
        let mut types = arena();
        let ids : Vec<_> = (0..N).map(|i| types.reference(&format!("demo/C{}", i))).collect();
        for i in 0..N {
            let supers : Vec<_> = edges.iter().filter(|e| e.0 % N == i).map(|e| ids[usize::from(e.1 % N)]).collect();
            if i % 3 == 0 {
                types.declare_interface(&format!("demo/C{}", i), &supers);
            } else {
                types.declare_class(&format!("demo/C{}", i), None, &supers);
            }
        }
        let (a, b) = (ids[usize::from(a % N)], ids[usize::from(b % N)]);
        let ab = types.common_supertype(a, b);
        let ba = types.common_supertype(b, a);
        TestResult::from_bool(ab == ba)
    }
}
