use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryFrom;
use std::fmt;

use classfile_parser::code_attribute::Instruction;

use crate::cil::Offset;
use crate::error::{Error, GeneralResult};
use crate::jvm;

/// A position in the emitted code, resolved to a byte offset at assembly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    /// first instruction translated from a source offset
    Source(Offset),
    /// handler entry of a region
    Handler(usize),
    /// type test for one clause of a region; one past the last clause rethrows
    Dispatch(usize, usize),
    FilterReject(usize, usize),
    /// continuation after a finally clause for one recorded leave target
    Resume(usize, usize),
    Synthetic(u32),
}

impl fmt::Display for Label {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        use Label::*;
        match self {
            Source(o)           => write!(f, "IL_{:04x}", o),
            Handler(r)          => write!(f, "handler{}", r),
            Dispatch(r, k)      => write!(f, "handler{}.clause{}", r, k),
            FilterReject(r, k)  => write!(f, "handler{}.reject{}", r, k),
            Resume(r, i)        => write!(f, "handler{}.resume{}", r, i),
            Synthetic(n)        => write!(f, "L{}", n),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    Insn(Instruction),
    Bind(Label),
    /// a branch instruction whose offset is filled in at assembly
    Branch { insn : Instruction, target : Label },
    Table { low : i32, targets : Vec<Label>, default : Label },
}

#[derive(Clone, Debug, Default)]
pub struct CodeBuffer {
    prologue : Vec<Item>,
    body : Vec<Item>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Assembly {
    pub code : Vec<(usize, Instruction)>,
    pub labels : BTreeMap<Label, usize>,
    pub length : usize,
}

impl CodeBuffer {
    pub fn new() -> CodeBuffer { Default::default() }

    pub fn emit(&mut self, insn : Instruction) {
        self.body.push(Item::Insn(insn));
    }

    /// code that runs before the first translated instruction
    pub fn emit_prologue(&mut self, insn : Instruction) {
        self.prologue.push(Item::Insn(insn));
    }

    pub fn branch(&mut self, insn : Instruction, target : Label) {
        self.body.push(Item::Branch { insn, target });
    }

    pub fn table(&mut self, low : i32, targets : Vec<Label>, default : Label) {
        self.body.push(Item::Table { low, targets, default });
    }

    pub fn bind(&mut self, label : Label) {
        self.body.push(Item::Bind(label));
    }

    /// Removes the last emitted instruction if it is exactly `insn` and nothing but labels
    /// accepted by `passable` follows it.
    pub fn retract(&mut self, insn : &Instruction, passable : impl Fn(&Label) -> bool) -> bool {
        for i in (0..self.body.len()).rev() {
            match &self.body[i] {
                Item::Bind(label) if passable(label) => continue,
                Item::Insn(last) if last == insn => {
                    self.body.remove(i);
                    return true;
                },
                _ => return false,
            }
        }
        false
    }

    pub fn len(&self) -> usize { self.prologue.len() + self.body.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn items(&self) -> impl Iterator<Item=&Item> {
        self.prologue.iter().chain(self.body.iter())
    }

    fn layout(&self, wide : &BTreeSet<usize>) -> GeneralResult<(BTreeMap<Label, usize>, Vec<usize>, usize)> {
        let mut labels = BTreeMap::new();
        let mut addrs = Vec::with_capacity(self.len());
        let mut addr = 0;
        for (i, item) in self.items().enumerate() {
            addrs.push(addr);
            addr += match item {
                Item::Insn(insn) => jvm::size(insn, addr),
                Item::Bind(label) => {
                    if labels.insert(*label, addr).is_some() {
                        return Err(Error::internal(format!("label {} bound twice", label)));
                    }
                    0
                },
                Item::Branch { .. } if wide.contains(&i) => 5,
                Item::Branch { insn, .. } => jvm::size(insn, addr),
                Item::Table { targets, .. } => jvm::table_size(addr, targets.len()),
            };
        }
        Ok((labels, addrs, addr))
    }

    /// Lays out the code, widening `goto`s whose targets are out of 16-bit reach, and patches
    /// every branch.
    pub fn assemble(&self) -> GeneralResult<Assembly> {
        let mut wide = BTreeSet::new();
        let (labels, addrs, length) = loop {
            let (labels, addrs, length) = self.layout(&wide)?;
            let mut grew = false;
            for (i, item) in self.items().enumerate() {
                if let Item::Branch { insn : Instruction::Goto(_), target } = item {
                    let dest = labels.get(target).copied().unwrap_or(0);
                    let off = dest as i64 - addrs[i] as i64;
                    if !wide.contains(&i) && i16::try_from(off).is_err() {
                        wide.insert(i);
                        grew = true;
                    }
                }
            }
            if !grew {
                break (labels, addrs, length);
            }
        };

        if length > usize::from(u16::max_value()) {
            return Err(Error::unsupported(format!("method code is {} bytes long", length)));
        }

        let find = |label : &Label| labels.get(label).copied()
            .ok_or_else(|| Error::internal(format!("branch to unbound label {}", label)));
        let relative = |from : usize, to : usize| to as i32 - from as i32;

        let mut code = Vec::new();
        for (i, item) in self.items().enumerate() {
            let addr = addrs[i];
            match item {
                Item::Bind(_) => {},
                Item::Insn(insn) => code.push((addr, insn.clone())),
                Item::Branch { target, .. } if wide.contains(&i) =>
                    code.push((addr, Instruction::GotoW(relative(addr, find(target)?)))),
                Item::Branch { insn, target } =>
                    code.push((addr, jvm::with_offset(insn, relative(addr, find(target)?))?)),
                Item::Table { low, targets, default } => {
                    let offsets = targets.iter()
                        .map(|t| Ok(relative(addr, find(t)?)))
                        .collect::<GeneralResult<Vec<_>>>()?;
                    let high = low + offsets.len() as i32 - 1;
                    let default = relative(addr, find(default)?);
                    code.push((addr, Instruction::Tableswitch { default, low : *low, high, offsets }));
                },
            }
        }

        Ok(Assembly { code, labels, length })
    }
}

#[test]
fn test_branch_patching() -> GeneralResult<()> {
    use Instruction::*;
    let mut buf = CodeBuffer::new();
    buf.emit_prologue(Iconst0);
    buf.emit_prologue(Istore1);
    buf.bind(Label::Source(0));
    buf.emit(Iload0);
    buf.branch(Ifeq(0), Label::Source(4));
    buf.emit(Iinc { index : 1, value : 1 });
    buf.bind(Label::Source(4));
    buf.emit(Return);
    let asm = buf.assemble()?;
    assert_eq!(asm.labels[&Label::Source(0)], 2);
    assert_eq!(asm.code[3], (3, Ifeq(6)));
    assert_eq!(asm.labels[&Label::Source(4)], 9);
    assert_eq!(asm.length, 10);
    Ok(())
}

#[test]
fn test_table_switch_alignment() -> GeneralResult<()> {
    use Instruction::*;
    let mut buf = CodeBuffer::new();
    buf.emit(Iconst0);
    buf.table(0, vec![ Label::Synthetic(0), Label::Synthetic(1) ], Label::Synthetic(1));
    buf.bind(Label::Synthetic(0));
    buf.emit(Nop);
    buf.bind(Label::Synthetic(1));
    buf.emit(Return);
    let asm = buf.assemble()?;
    // opcode at 1, two bytes of padding, then 12 + 8 bytes of operands
    assert_eq!(asm.labels[&Label::Synthetic(0)], 24);
    assert_eq!(asm.code[1], (1, Tableswitch { default : 24, low : 0, high : 1, offsets : vec![ 23, 24 ] }));
    Ok(())
}

#[test]
fn test_far_goto_widens() -> GeneralResult<()> {
    use Instruction::*;
    let mut buf = CodeBuffer::new();
    buf.branch(Goto(0), Label::Synthetic(0));
    for _ in 0..40_000 {
        buf.emit(Nop);
    }
    buf.bind(Label::Synthetic(0));
    buf.emit(Return);
    let asm = buf.assemble()?;
    assert_eq!(asm.code[0], (0, GotoW(40_005)));
    Ok(())
}

#[test]
fn test_unbound_label_is_internal() {
    use crate::error::ErrorKind;
    let mut buf = CodeBuffer::new();
    buf.branch(Instruction::Goto(0), Label::Handler(3));
    let e = buf.assemble().unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Internal);
}

#[test]
fn test_retract_steps_over_passable_labels() {
    use Instruction::*;
    let mut buf = CodeBuffer::new();
    buf.bind(Label::Source(0));
    buf.emit(Aconstnull);
    buf.bind(Label::Source(1));
    assert!(!buf.retract(&Aconstnull, |_| false));
    assert!(buf.retract(&Aconstnull, |l| *l == Label::Source(1)));
    assert_eq!(buf.len(), 2);
    // only the last instruction is a candidate
    assert!(!buf.retract(&Aconstnull, |_| true));
}
