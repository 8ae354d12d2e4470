use crate::types::{PrimitiveKind, TypeId};

/// Byte offset of an instruction in the source method body.
pub type Offset = usize;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ArithmeticOperation {
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    Neg,
    Not,
}

impl ArithmeticOperation {
    pub fn is_unary(self) -> bool {
        use ArithmeticOperation::*;
        match self {
            Neg | Not => true,
            _ => false,
        }
    }

    pub fn is_shift(self) -> bool {
        use ArithmeticOperation::*;
        match self {
            Shl | Shr | ShrUn => true,
            _ => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodRef {
    pub owner : TypeId,
    pub name : String,
    pub params : Vec<TypeId>,
    pub returns : Option<TypeId>,
    pub is_static : bool,
}

impl MethodRef {
    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor"
    }

    /// name as it appears in the JVM constant pool
    pub fn jvm_name(&self) -> &str {
        match self.name.as_str() {
            ".ctor"  => "<init>",
            ".cctor" => "<clinit>",
            other    => other,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldRef {
    pub owner : TypeId,
    pub name : String,
    pub ty : TypeId,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Nop,
    LoadArg     (u16),
    StoreArg    (u16),
    LoadLocal   (u16),
    StoreLocal  (u16),
    AddressOf   (u16), /* i.e. ldloca */
    LoadInt32   (i32),
    LoadInt64   (i64),
    LoadFloat32 (f32),
    LoadFloat64 (f64),
    LoadNull,
    LoadString  (String),
    Dup,
    Pop,
    Arithmetic  (ArithmeticOperation),
    Convert     { to : PrimitiveKind, checked : bool },
    Compare     { way : Comparison, unsigned : bool },
    Branch      { way : Comparison, unsigned : bool, target : Offset },
    BranchIf    { truth : bool, target : Offset },
    Jump        (Offset),
    Switch      (Vec<Offset>),
    Return,
    Throw,
    Rethrow,
    Leave       (Offset),
    EndFinally, /* also endfault */
    EndFilter,
    Call        { method : MethodRef, virtual_call : bool },
    NewObject   (MethodRef),
    LoadField   { field : FieldRef, is_static : bool },
    StoreField  { field : FieldRef, is_static : bool },
    NewArray    (TypeId),
    LoadLength,
    LoadElement,
    StoreElement,
    Box         (TypeId),
    UnboxAny    (TypeId),
    CastClass   (TypeId),
    IsInstance  (TypeId),
}

impl Op {
    /// destinations other than the following instruction
    pub fn targets(&self) -> Vec<Offset> {
        use Op::*;
        match self {
            Branch { target, .. } | BranchIf { target, .. } => vec![ *target ],
            Jump(target) | Leave(target) => vec![ *target ],
            Switch(targets) => targets.clone(),
            _ => vec![],
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum HandlerKind {
    Catch,
    Filter,
    Finally,
    Fault,
}

/// One clause as listed in the method header; `try_end` and `handler_end` are exclusive.
#[derive(Clone, Debug, PartialEq)]
pub struct ExceptionHandler {
    pub try_start : Offset,
    pub try_end : Offset,
    pub kind : HandlerKind,
    pub handler_start : Offset,
    pub handler_end : Offset,
    pub filter_start : Option<Offset>,
    pub catch_type : Option<TypeId>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MethodKind {
    Static,
    Instance,
    Constructor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub name : Option<String>,
    pub ty : TypeId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodBody {
    pub owner : TypeId,
    pub name : String,
    pub kind : MethodKind,
    pub params : Vec<Variable>,
    pub variables : Vec<Variable>,
    pub returns : Option<TypeId>,
    pub code : Vec<(Offset, Op)>,
    pub handlers : Vec<ExceptionHandler>,
}

impl MethodBody {
    /// offset just past the last instruction
    pub fn end(&self) -> Offset {
        self.code.last().map(|(o, _)| o + 1).unwrap_or(0)
    }

    /// Clamps an exclusive end offset that points past the last instruction.
    pub fn normalize_end(&self, offset : Offset) -> Offset {
        offset.min(self.end())
    }

    pub fn is_boundary(&self, offset : Offset) -> bool {
        self.code.binary_search_by_key(&offset, |(o, _)| *o).is_ok()
    }

    pub fn following(&self, offset : Offset) -> Option<Offset> {
        let index = self.code.binary_search_by_key(&offset, |(o, _)| *o).ok()?;
        self.code.get(index + 1).map(|(o, _)| *o)
    }
}

#[test]
fn test_op_shapes() {
    use Op::*;
    assert_eq!(Switch(vec![ 4, 8 ]).targets(), vec![ 4, 8 ]);
    assert_eq!(Leave(3).targets(), vec![ 3 ]);
    assert!(Return.targets().is_empty());
}
