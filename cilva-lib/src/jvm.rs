use std::convert::TryFrom;

use classfile_parser::code_attribute::Instruction;

use crate::cil::Comparison;
use crate::constants::{short_index, ConstantPool};
use crate::error::{Error, GeneralResult};
use crate::types::{PrimitiveKind, StackKind};

macro_rules! local_op {
    ( $slot:expr, $short:ident, $wide:ident, [ $n0:ident, $n1:ident, $n2:ident, $n3:ident ] ) => {
        match $slot {
            0 => $n0,
            1 => $n1,
            2 => $n2,
            3 => $n3,
            n => match u8::try_from(n) {
                Ok(b) => $short(b),
                Err(_) => $wide(n),
            },
        }
    };
}

pub fn load(kind : StackKind, slot : u16) -> Instruction {
    use Instruction::*;
    match kind {
        StackKind::Int       => local_op!(slot, Iload, IloadWide, [ Iload0, Iload1, Iload2, Iload3 ]),
        StackKind::Long      => local_op!(slot, Lload, LloadWide, [ Lload0, Lload1, Lload2, Lload3 ]),
        StackKind::Float     => local_op!(slot, Fload, FloadWide, [ Fload0, Fload1, Fload2, Fload3 ]),
        StackKind::Double    => local_op!(slot, Dload, DloadWide, [ Dload0, Dload1, Dload2, Dload3 ]),
        StackKind::Reference => local_op!(slot, Aload, AloadWide, [ Aload0, Aload1, Aload2, Aload3 ]),
    }
}

pub fn store(kind : StackKind, slot : u16) -> Instruction {
    use Instruction::*;
    match kind {
        StackKind::Int       => local_op!(slot, Istore, IstoreWide, [ Istore0, Istore1, Istore2, Istore3 ]),
        StackKind::Long      => local_op!(slot, Lstore, LstoreWide, [ Lstore0, Lstore1, Lstore2, Lstore3 ]),
        StackKind::Float     => local_op!(slot, Fstore, FstoreWide, [ Fstore0, Fstore1, Fstore2, Fstore3 ]),
        StackKind::Double    => local_op!(slot, Dstore, DstoreWide, [ Dstore0, Dstore1, Dstore2, Dstore3 ]),
        StackKind::Reference => local_op!(slot, Astore, AstoreWide, [ Astore0, Astore1, Astore2, Astore3 ]),
    }
}

pub fn ret(kind : Option<StackKind>) -> Instruction {
    use Instruction::*;
    match kind {
        None                        => Return,
        Some(StackKind::Int)        => Ireturn,
        Some(StackKind::Long)       => Lreturn,
        Some(StackKind::Float)      => Freturn,
        Some(StackKind::Double)     => Dreturn,
        Some(StackKind::Reference)  => Areturn,
    }
}

pub fn pop(category : u8) -> Instruction {
    if category == 2 { Instruction::Pop2 } else { Instruction::Pop }
}

pub fn dup(category : u8) -> Instruction {
    if category == 2 { Instruction::Dup2 } else { Instruction::Dup }
}

pub fn ldc(index : u16) -> Instruction {
    match short_index(index) {
        Some(i) => Instruction::Ldc(i),
        None    => Instruction::LdcW(index),
    }
}

pub fn int_constant(pool : &mut ConstantPool, value : i32) -> GeneralResult<Instruction> {
    use Instruction::*;
    Ok(match value {
        -1 => Iconstm1,
        0  => Iconst0,
        1  => Iconst1,
        2  => Iconst2,
        3  => Iconst3,
        4  => Iconst4,
        5  => Iconst5,
        v => if let Ok(b) = i8::try_from(v) {
            Bipush(b)
        } else if let Ok(s) = i16::try_from(v) {
            Sipush(s)
        } else {
            ldc(pool.integer(v)?)
        },
    })
}

pub fn long_constant(pool : &mut ConstantPool, value : i64) -> GeneralResult<Instruction> {
    use Instruction::*;
    Ok(match value {
        0 => Lconst0,
        1 => Lconst1,
        v => Ldc2W(pool.long(v)?),
    })
}

pub fn float_constant(pool : &mut ConstantPool, value : f32) -> GeneralResult<Instruction> {
    use Instruction::*;
    // compare bits so that -0.0 still goes through the pool
    Ok(match value.to_bits() {
        b if b == 0.0_f32.to_bits() => Fconst0,
        b if b == 1.0_f32.to_bits() => Fconst1,
        b if b == 2.0_f32.to_bits() => Fconst2,
        _ => ldc(pool.float(value)?),
    })
}

pub fn double_constant(pool : &mut ConstantPool, value : f64) -> GeneralResult<Instruction> {
    use Instruction::*;
    Ok(match value.to_bits() {
        b if b == 0.0_f64.to_bits() => Dconst0,
        b if b == 1.0_f64.to_bits() => Dconst1,
        _ => Ldc2W(pool.double(value)?),
    })
}

/// `None` selects the reference form.
pub fn array_load(element : Option<PrimitiveKind>) -> Instruction {
    use Instruction::*;
    use PrimitiveKind::*;
    match element {
        Some(Boolean) | Some(Int8) | Some(UInt8)    => Baload,
        Some(Char) | Some(UInt16)                   => Caload,
        Some(Int16)                                 => Saload,
        Some(Int32) | Some(UInt32)                  => Iaload,
        Some(Int64) | Some(UInt64)                  => Laload,
        Some(Float32)                               => Faload,
        Some(Float64)                               => Daload,
        None                                        => Aaload,
    }
}

pub fn array_store(element : Option<PrimitiveKind>) -> Instruction {
    use Instruction::*;
    use PrimitiveKind::*;
    match element {
        Some(Boolean) | Some(Int8) | Some(UInt8)    => Bastore,
        Some(Char) | Some(UInt16)                   => Castore,
        Some(Int16)                                 => Sastore,
        Some(Int32) | Some(UInt32)                  => Iastore,
        Some(Int64) | Some(UInt64)                  => Lastore,
        Some(Float32)                               => Fastore,
        Some(Float64)                               => Dastore,
        None                                        => Aastore,
    }
}

/// single-operand test against zero, offset to be patched
pub fn if_zero(way : Comparison) -> Instruction {
    use Instruction::*;
    match way {
        Comparison::Eq => Ifeq(0),
        Comparison::Ne => Ifne(0),
        Comparison::Lt => Iflt(0),
        Comparison::Ge => Ifge(0),
        Comparison::Gt => Ifgt(0),
        Comparison::Le => Ifle(0),
    }
}

pub fn if_icmp(way : Comparison) -> Instruction {
    use Instruction::*;
    match way {
        Comparison::Eq => IfIcmpeq(0),
        Comparison::Ne => IfIcmpne(0),
        Comparison::Lt => IfIcmplt(0),
        Comparison::Ge => IfIcmpge(0),
        Comparison::Gt => IfIcmpgt(0),
        Comparison::Le => IfIcmple(0),
    }
}

fn switch_padding(addr : usize) -> usize {
    (4 - (addr + 1) % 4) % 4
}

pub fn table_size(addr : usize, count : usize) -> usize {
    1 + switch_padding(addr) + 12 + 4 * count
}

/// Encoded length in bytes of `insn` placed at `addr`.
pub fn size(insn : &Instruction, addr : usize) -> usize {
    use Instruction::*;
    match insn {
        Bipush(_) | Ldc(_) | Newarray(_) | Ret(_) |
        Iload(_) | Lload(_) | Fload(_) | Dload(_) | Aload(_) |
        Istore(_) | Lstore(_) | Fstore(_) | Dstore(_) | Astore(_)
            => 2,

        Sipush(_) | LdcW(_) | Ldc2W(_) | Iinc { .. } |
        Ifeq(_) | Ifne(_) | Iflt(_) | Ifge(_) | Ifgt(_) | Ifle(_) |
        IfIcmpeq(_) | IfIcmpne(_) | IfIcmplt(_) | IfIcmpge(_) | IfIcmpgt(_) | IfIcmple(_) |
        IfAcmpeq(_) | IfAcmpne(_) | Ifnull(_) | Ifnonnull(_) | Goto(_) | Jsr(_) |
        Getstatic(_) | Putstatic(_) | Getfield(_) | Putfield(_) |
        Invokevirtual(_) | Invokespecial(_) | Invokestatic(_) |
        New(_) | Anewarray(_) | Checkcast(_) | Instanceof(_)
            => 3,

        IloadWide(_) | LloadWide(_) | FloadWide(_) | DloadWide(_) | AloadWide(_) |
        IstoreWide(_) | LstoreWide(_) | FstoreWide(_) | DstoreWide(_) | AstoreWide(_) |
        RetWide(_) | Multianewarray { .. }
            => 4,

        Invokeinterface { .. } | Invokedynamic(_) | GotoW(_) | JsrW(_) => 5,

        IincWide { .. } => 6,

        Tableswitch { offsets, .. } => table_size(addr, offsets.len()),
        Lookupswitch { pairs, .. } => 1 + switch_padding(addr) + 8 + 8 * pairs.len(),

        _ => 1,
    }
}

/// whether execution never continues at the following instruction
pub fn is_unconditional(insn : &Instruction) -> bool {
    use Instruction::*;
    match insn {
        Goto(_) | GotoW(_) | Athrow | Ret(_) | RetWide(_) |
        Ireturn | Lreturn | Freturn | Dreturn | Areturn | Return |
        Tableswitch { .. } | Lookupswitch { .. }
            => true,
        _ => false,
    }
}

/// Replaces the relative offset of a branch instruction.
pub fn with_offset(insn : &Instruction, offset : i32) -> GeneralResult<Instruction> {
    use Instruction::*;
    let short = || i16::try_from(offset)
        .map_err(|_| Error::unsupported(format!("branch offset {} does not fit in 16 bits", offset)));
    Ok(match insn {
        Goto(_)      => Goto(short()?),
        GotoW(_)     => GotoW(offset),
        Ifeq(_)      => Ifeq(short()?),
        Ifne(_)      => Ifne(short()?),
        Iflt(_)      => Iflt(short()?),
        Ifge(_)      => Ifge(short()?),
        Ifgt(_)      => Ifgt(short()?),
        Ifle(_)      => Ifle(short()?),
        IfIcmpeq(_)  => IfIcmpeq(short()?),
        IfIcmpne(_)  => IfIcmpne(short()?),
        IfIcmplt(_)  => IfIcmplt(short()?),
        IfIcmpge(_)  => IfIcmpge(short()?),
        IfIcmpgt(_)  => IfIcmpgt(short()?),
        IfIcmple(_)  => IfIcmple(short()?),
        IfAcmpeq(_)  => IfAcmpeq(short()?),
        IfAcmpne(_)  => IfAcmpne(short()?),
        Ifnull(_)    => Ifnull(short()?),
        Ifnonnull(_) => Ifnonnull(short()?),
        other => return Err(Error::internal(format!("{:?} is not a branch", other))),
    })
}

#[test]
fn test_local_forms() {
    use Instruction::*;
    assert_eq!(load(StackKind::Int, 2), Iload2);
    assert_eq!(load(StackKind::Reference, 200), Aload(200));
    assert_eq!(store(StackKind::Long, 300), LstoreWide(300));
    assert_eq!(size(&LstoreWide(300), 0), 4);
}

#[test]
fn test_constants() -> GeneralResult<()> {
    use Instruction::*;
    let mut pool = ConstantPool::new();
    assert_eq!(int_constant(&mut pool, -1)?, Iconstm1);
    assert_eq!(int_constant(&mut pool, 100)?, Bipush(100));
    assert_eq!(int_constant(&mut pool, -300)?, Sipush(-300));
    assert_eq!(int_constant(&mut pool, 1 << 20)?, Ldc(1));
    assert_eq!(float_constant(&mut pool, 2.0)?, Fconst2);
    assert_eq!(float_constant(&mut pool, -0.0)?, Ldc(2));
    assert_eq!(long_constant(&mut pool, 7)?, Ldc2W(3));
    Ok(())
}

#[test]
fn test_switch_padding() {
    assert_eq!(table_size(0, 2), 1 + 3 + 12 + 8);
    assert_eq!(table_size(3, 2), 1 + 0 + 12 + 8);
    assert_eq!(table_size(5, 0), 1 + 2 + 12);
}

#[test]
fn test_patch() -> GeneralResult<()> {
    use Instruction::*;
    assert_eq!(with_offset(&Ifeq(0), -12)?, Ifeq(-12));
    assert!(with_offset(&Ifne(0), 40_000).is_err());
    assert_eq!(with_offset(&GotoW(0), 40_000)?, GotoW(40_000));
    assert!(with_offset(&Nop, 1).is_err());
    Ok(())
}
