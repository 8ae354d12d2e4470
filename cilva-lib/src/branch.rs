use classfile_parser::code_attribute::Instruction;

use crate::cil::{Comparison, Offset};
use crate::code::Label;
use crate::config::MethodSpec;
use crate::error::{Error, GeneralResult};
use crate::jvm;
use crate::translate::Translator;
use crate::types::{AbstractType, GenericRole, PrimitiveKind, StackKind, TypeId};

fn is_relational(way : Comparison) -> bool {
    match way {
        Comparison::Eq | Comparison::Ne => false,
        _ => true,
    }
}

/// `fcmpg` yields 1 for NaN, `fcmpl` -1; pick whichever makes an ordered comparison fail and an
/// unordered one succeed.
fn use_g_variant(way : Comparison, unordered : bool) -> bool {
    use Comparison::*;
    match way {
        Lt | Le => !unordered,
        Gt | Ge => unordered,
        Eq | Ne => false,
    }
}

impl<'a> Translator<'a> {
    /// Pops two operands, emits whatever reduces them to a single test, and returns the
    /// branch instruction performing that test.
    fn comparison(&mut self, way : Comparison, unsigned : bool) -> GeneralResult<Instruction> {
        use Instruction::*;

        let (b, bk) = self.pop_kind()?;
        let (a, ak) = self.pop_kind()?;
        if ak != bk {
            return Err(Error::malformed(format!(
                "comparison of {} with {}", self.types.describe(a), self.types.describe(b))));
        }

        match ak {
            StackKind::Int if unsigned && is_relational(way) => {
                self.invoke_static(&MethodSpec::new("java/lang/Integer", "compareUnsigned", "(II)I"))?;
                Ok(jvm::if_zero(way))
            },
            StackKind::Int => Ok(jvm::if_icmp(way)),
            StackKind::Long => {
                if unsigned && is_relational(way) {
                    self.invoke_static(&MethodSpec::new("java/lang/Long", "compareUnsigned", "(JJ)I"))?;
                } else {
                    self.emit(Lcmp);
                }
                Ok(jvm::if_zero(way))
            },
            StackKind::Float => {
                self.emit(if use_g_variant(way, unsigned) { Fcmpg } else { Fcmpl });
                Ok(jvm::if_zero(way))
            },
            StackKind::Double => {
                self.emit(if use_g_variant(way, unsigned) { Dcmpg } else { Dcmpl });
                Ok(jvm::if_zero(way))
            },
            StackKind::Reference => {
                // `cgt.un` against null is how a non-null test is written
                let way = match way {
                    Comparison::Gt if unsigned => Comparison::Ne,
                    w if is_relational(w) => return Err(Error::malformed(format!(
                        "ordered comparison of {} with {}", self.types.describe(a), self.types.describe(b)))),
                    w => w,
                };
                let against_null = self.types.get(b) == &AbstractType::Null && self.retract_null();
                Ok(match (way, against_null) {
                    (Comparison::Eq, true)  => Ifnull(0),
                    (_, true)               => Ifnonnull(0),
                    (Comparison::Eq, false) => IfAcmpeq(0),
                    (_, false)              => IfAcmpne(0),
                })
            },
        }
    }

    pub(crate) fn conditional_branch(&mut self, way : Comparison, unsigned : bool, target : Offset) -> GeneralResult<()> {
        let insn = self.comparison(way, unsigned)?;
        self.branch_to(insn, Label::Source(target))
    }

    pub(crate) fn branch_if(&mut self, truth : bool, target : Offset) -> GeneralResult<()> {
        use Instruction::*;

        let (ty, kind) = self.pop_kind()?;
        let insn = match kind {
            StackKind::Int => if truth { Ifne(0) } else { Ifeq(0) },
            StackKind::Long => {
                self.emit(Lconst0);
                self.emit(Lcmp);
                self.note_depth(4);
                if truth { Ifne(0) } else { Ifeq(0) }
            },
            StackKind::Reference => if truth { Ifnonnull(0) } else { Ifnull(0) },
            _ => return Err(Error::malformed(format!("branch on {}", self.types.describe(ty)))),
        };
        self.branch_to(insn, Label::Source(target))
    }

    /// Materializes a comparison as 0 or 1.
    pub(crate) fn compare(&mut self, way : Comparison, unsigned : bool) -> GeneralResult<()> {
        use Instruction::*;

        let insn = self.comparison(way, unsigned)?;
        let (yes, done) = (self.fresh_label(), self.fresh_label());
        let int = self.types.primitive(PrimitiveKind::Int32);

        self.branch_to(insn, yes)?;
        self.emit(Iconst0);
        self.push(int)?;
        self.jump(done)?;

        self.bind_label(yes)?;
        self.emit(Iconst1);
        self.push(int)?;
        self.bind_label(done)
    }

    /// A zero-based jump table; values out of range continue with the next instruction.
    pub(crate) fn switch(&mut self, offset : Offset, targets : &[Offset]) -> GeneralResult<()> {
        let next = self.body.following(offset)
            .ok_or_else(|| Error::malformed(format!("switch at {} is the last instruction", offset)))?;
        if targets.is_empty() {
            let ty = self.pop()?;
            self.emit(jvm::pop(self.types.category(ty)));
            return Ok(());
        }
        let labels = targets.iter().map(|&t| Label::Source(t)).collect();
        self.switch_to(0, labels, Label::Source(next))
    }

    /// `isinst`: the object itself when it has type `ty`, null otherwise.
    pub(crate) fn is_instance(&mut self, ty : TypeId) -> GeneralResult<()> {
        use Instruction::*;

        let value = self.pop_reference()?;

        // a resolved parameter is tested against its erasure below
        if let AbstractType::GenericParameter { name, role : GenericRole::Unresolved } = self.types.get(ty).clone() {
            let index = self.pool.string(&name)?;
            self.emit(jvm::ldc(index));
            self.note_depth(2);
            let helper = self.config.generic_catch.clone();
            self.invoke_static(&helper)?;
            return self.push(ty);
        }

        let class = self.class_index(ty)?;
        let keep = self.fresh_label();
        let result = if self.types.is_value(ty) { self.types.boxed(ty, false) } else { ty };

        self.push(value)?;
        self.emit(Dup);
        self.emit(Instanceof(class));
        self.note_depth(1);
        self.branch_to(Ifne(0), keep)?;
        self.pop()?;
        self.emit(Pop);
        self.emit(Aconstnull);
        let null = self.types.null();
        self.push(null)?;
        self.bind_label(keep)?;
        self.pop()?;
        self.emit(Checkcast(class));
        self.push(result)
    }
}

#[cfg(test)]
use crate::translate::fixture::Fixture;
#[cfg(test)]
use crate::cil::Op;

#[cfg(test)]
fn instructions(fx : &mut Fixture, variables : &[TypeId], code : Vec<(Offset, Op)>) -> GeneralResult<Vec<Instruction>> {
    let body = fx.body(variables, code, vec![]);
    Ok(fx.translate(&body)?.code.into_iter().map(|(_, i)| i).collect())
}

#[test]
fn test_null_comparison_collapses() -> GeneralResult<()> {
    use Instruction::*;
    let mut fx = Fixture::new();
    let object = fx.types.object();
    let insns = instructions(&mut fx, &[ object ], vec![
        (0, Op::LoadLocal(0)),
        (1, Op::LoadNull),
        (2, Op::Branch { way : Comparison::Eq, unsigned : false, target : 4 }),
        (3, Op::Nop),
        (4, Op::Return),
    ])?;
    assert_eq!(insns, vec![ Aconstnull, Astore0, Aload0, Ifnull(3), Return ]);
    Ok(())
}

#[test]
fn test_null_comparison_variants() -> GeneralResult<()> {
    use Instruction::*;
    let mut fx = Fixture::new();
    let object = fx.types.object();
    let insns = instructions(&mut fx, &[ object ], vec![
        (0, Op::LoadLocal(0)),
        (1, Op::LoadNull),
        (2, Op::Branch { way : Comparison::Ne, unsigned : false, target : 4 }),
        (3, Op::Nop),
        (4, Op::Return),
    ])?;
    assert_eq!(insns, vec![ Aconstnull, Astore0, Aload0, Ifnonnull(3), Return ]);

    // the null arrives along a jump, so it cannot be taken back
    let insns = instructions(&mut fx, &[ object ], vec![
        (0, Op::LoadLocal(0)),
        (1, Op::LoadNull),
        (2, Op::Jump(3)),
        (3, Op::Branch { way : Comparison::Eq, unsigned : false, target : 5 }),
        (4, Op::Nop),
        (5, Op::Return),
    ])?;
    assert!(insns.iter().any(|i| matches!(i, IfAcmpeq(_))));
    assert!(!insns.iter().any(|i| matches!(i, Ifnull(_))));
    assert_eq!(insns.iter().filter(|&i| *i == Aconstnull).count(), 2);
    Ok(())
}

#[test]
fn test_float_comparison_variants() {
    use Comparison::*;
    assert!(use_g_variant(Lt, false));
    assert!(!use_g_variant(Lt, true));
    assert!(!use_g_variant(Gt, false));
    assert!(use_g_variant(Ge, true));
    assert!(!use_g_variant(Eq, false));
}

#[test]
fn test_compare_yields_int() -> GeneralResult<()> {
    use Instruction::*;
    let mut fx = Fixture::new();
    let int = fx.int();
    let insns = instructions(&mut fx, &[ int, int ], vec![
        (0, Op::LoadLocal(0)),
        (1, Op::LoadLocal(1)),
        (2, Op::Compare { way : Comparison::Lt, unsigned : true }),
        (3, Op::StoreLocal(0)),
        (4, Op::Return),
    ])?;
    let tail = &insns[insns.len() - 7..];
    assert!(matches!(tail[0], Invokestatic(_)));
    assert_eq!(&tail[1..], &[ Iflt(7), Iconst0, Goto(4), Iconst1, Istore0, Return ]);
    Ok(())
}

#[test]
fn test_switch_defaults_to_next() -> GeneralResult<()> {
    let mut fx = Fixture::new();
    let int = fx.int();
    let body = fx.body(&[ int ], vec![
        (0, Op::LoadLocal(0)),
        (1, Op::Switch(vec![ 3, 4 ])),
        (2, Op::Return),
        (3, Op::Return),
        (4, Op::Return),
    ], vec![]);
    let m = fx.translate(&body)?;
    let (addr, insn) = &m.code[3];
    match insn {
        Instruction::Tableswitch { default, low : 0, high : 1, .. } =>
            assert_eq!(addr + *default as usize, m.source_offsets[&2]),
        other => panic!("expected a table switch, found {:?}", other),
    }
    // every switch target starts a frame
    let framed : Vec<_> = m.stack_map.iter().map(|e| usize::from(e.offset)).collect();
    assert_eq!(framed, vec![ m.source_offsets[&2], m.source_offsets[&3], m.source_offsets[&4] ]);
    Ok(())
}

#[test]
fn test_is_instance_keeps_or_nulls() -> GeneralResult<()> {
    use Instruction::*;
    let mut fx = Fixture::new();
    let object = fx.types.object();
    let shape = fx.types.declare_class("demo/Shape", None, &[]);
    let insns = instructions(&mut fx, &[ object, shape ], vec![
        (0, Op::LoadLocal(0)),
        (1, Op::IsInstance(shape)),
        (2, Op::StoreLocal(1)),
        (3, Op::Return),
    ])?;
    let body : Vec<_> = insns.iter().skip_while(|i| **i != Aload0).cloned().collect();
    assert_eq!(body.len(), 9);
    assert_eq!(body[1], Dup);
    assert!(matches!(body[2], Instanceof(_)));
    assert_eq!(&body[3..6], &[ Ifne(5), Pop, Aconstnull ]);
    assert!(matches!(body[6], Checkcast(_)));
    assert_eq!(&body[7..], &[ Astore1, Return ]);
    Ok(())
}

#[test]
fn test_is_instance_of_generic_parameter() -> GeneralResult<()> {
    use crate::types::GenericRole::*;
    use Instruction::*;
    let mut fx = Fixture::new();
    let object = fx.types.object();
    let helper = fx.config.generic_catch.clone();

    let open = fx.types.generic("T", Unresolved);
    let insns = instructions(&mut fx, &[ object, open ], vec![
        (0, Op::LoadLocal(0)),
        (1, Op::IsInstance(open)),
        (2, Op::StoreLocal(1)),
        (3, Op::Return),
    ])?;
    let name = fx.pool.string("T")?;
    let call = fx.pool.method_ref(&helper.class, &helper.name, &helper.descriptor, false)?;
    let body : Vec<_> = insns.iter().skip_while(|i| **i != Aload0).cloned().collect();
    assert_eq!(body, vec![ Aload0, jvm::ldc(name), Invokestatic(call), Astore1, Return ]);

    // a bound parameter is tested against its erasure
    let bound = fx.types.generic("U", Resolved);
    let insns = instructions(&mut fx, &[ object, bound ], vec![
        (0, Op::LoadLocal(0)),
        (1, Op::IsInstance(bound)),
        (2, Op::StoreLocal(1)),
        (3, Op::Return),
    ])?;
    let erased = fx.pool.class("java/lang/Object")?;
    assert!(!insns.contains(&Invokestatic(call)));
    assert!(insns.contains(&Instanceof(erased)));
    assert!(insns.contains(&Checkcast(erased)));
    Ok(())
}
