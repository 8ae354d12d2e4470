use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryFrom;

use classfile_parser::code_attribute::Instruction;

use crate::cil::{ArithmeticOperation, FieldRef, MethodBody, MethodKind, MethodRef, Offset, Op};
use crate::code::{CodeBuffer, Label};
use crate::config::{Config, MethodSpec};
use crate::constants::ConstantPool;
use crate::error::{Error, GeneralResult};
use crate::frames::{stack_map_entry, Frame, FrameStore, Saved};
use crate::jvm;
use crate::locals::{SlotAllocator, SlotKind};
use crate::regions::RegionTree;
use crate::types::{AbstractType, PrimitiveKind, StackKind, TypeArena, TypeId, ValueKind};
use crate::{ExceptionTableEntry, LocalVariable, Method};

/// Translation state for one method body.
pub(crate) struct Translator<'a> {
    pub(crate) body : &'a MethodBody,
    pub(crate) types : &'a mut TypeArena,
    pub(crate) pool : &'a mut ConstantPool,
    pub(crate) config : &'a Config,
    pub(crate) frames : FrameStore,
    pub(crate) slots : SlotAllocator,
    pub(crate) code : CodeBuffer,
    pub(crate) regions : RegionTree,
    /// source offsets some instruction transfers control to
    targets : BTreeSet<Offset>,
    pub(crate) reachable : bool,
    pub(crate) current : Offset,
    next_label : u32,
    last_transfer : Option<Label>,
    /// regions whose finally resumption code has been emitted
    pub(crate) resumed : BTreeSet<usize>,
    prologue_stack : u16,
}

impl<'a> Translator<'a> {
    pub(crate) fn new(body : &'a MethodBody, types : &'a mut TypeArena, pool : &'a mut ConstantPool, config : &'a Config)
        -> GeneralResult<Translator<'a>>
    {
        let mut slots = SlotAllocator::new();
        let mut locals = BTreeMap::new();

        if body.kind != MethodKind::Static {
            let slot = slots.allocate_argument(types, body.owner, Some("this".to_owned()))?;
            let this = if body.kind == MethodKind::Constructor && !types.is_value(body.owner) {
                types.uninitialized_this()
            } else {
                body.owner
            };
            locals.insert(slot, this);
        }
        for p in &body.params {
            let slot = slots.allocate_argument(types, p.ty, p.name.clone())?;
            locals.insert(slot, p.ty);
        }
        for v in &body.variables {
            slots.allocate_variable(types, v.ty, v.name.clone())?;
        }

        let regions = RegionTree::build(body, types, config, &mut slots)?;

        let mut targets = BTreeSet::new();
        for (offset, op) in &body.code {
            for t in op.targets() {
                if !body.is_boundary(t) {
                    return Err(Error::malformed(format!(
                        "branch at {} targets {}, which is not an instruction", Label::Source(*offset), t)));
                }
                targets.insert(t);
            }
            if let Op::Switch(_) = op {
                targets.extend(body.following(*offset));
            }
        }

        Ok(Translator {
            body,
            types,
            pool,
            config,
            frames : FrameStore::new(Frame::new(Vec::new(), locals)),
            slots,
            code : CodeBuffer::new(),
            regions,
            targets,
            reachable : true,
            current : 0,
            next_label : 0,
            last_transfer : None,
            resumed : BTreeSet::new(),
            prologue_stack : 0,
        })
    }

    pub(crate) fn run(mut self, name : String) -> GeneralResult<Method> {
        let body = self.body;
        for (offset, op) in &body.code {
            self.current = *offset;
            self.enter(*offset)?;
            log::trace!("{}: {:?}", Label::Source(*offset), op);
            self.translate_op(*offset, op)?;
        }
        if self.reachable {
            return Err(Error::malformed("control falls off the end of the method"));
        }
        self.finish(name)
    }

    fn finish(mut self, name : String) -> GeneralResult<Method> {
        let filled = self.frames.backfill_unconditional_branches()?;
        if filled > 0 {
            log::debug!("backfilled {} frames after unconditional transfers", filled);
        }

        let asm = self.code.assemble()?;
        let frames = self.frames.resolve(self.types, &asm.labels)?;

        for pair in asm.code.windows(2) {
            let (addr, next) = (pair[0].0, pair[1].0);
            if jvm::is_unconditional(&pair[0].1) && !frames.contains_key(&next) {
                return Err(Error::internal(format!(
                    "missing frame after unconditional transfer at byte {}", addr)));
            }
        }

        let stack_map = frames.iter()
            .filter(|(addr, _)| **addr < asm.length)
            .map(|(&addr, f)| stack_map_entry(self.types, self.pool, addr, f))
            .collect::<GeneralResult<Vec<_>>>()?;

        let address = |label : Label| asm.labels.get(&label).copied()
            .ok_or_else(|| Error::internal(format!("unbound label {}", label)))
            .and_then(|a| u16::try_from(a).map_err(|_| Error::internal("address out of range")));
        let catch_type = self.pool.class(&self.config.throwable_class)?;
        let mut exception_table = Vec::new();
        for (r, region) in self.regions.iter().enumerate() {
            let start_pc = address(Label::Source(region.start))?;
            let end_pc = if region.end == region.handler_offset() {
                address(Label::Handler(r))?
            } else {
                address(Label::Source(region.end))?
            };
            let handler_pc = address(Label::Handler(r))?;
            if start_pc < end_pc {
                exception_table.push(ExceptionTableEntry { start_pc, end_pc, handler_pc, catch_type });
            }
        }

        let local_variables = self.slots.named_slots()
            .map(|(slot, name, ty)| Ok(LocalVariable {
                name : name.to_owned(),
                slot,
                descriptor : self.types.descriptor(ty)?,
            }))
            .collect::<GeneralResult<Vec<_>>>()?;

        let source_offsets = asm.labels.iter()
            .filter_map(|(label, &addr)| match label {
                Label::Source(o) => Some((*o, addr)),
                _ => None,
            })
            .collect();

        Ok(Method {
            name,
            code : asm.code,
            exception_table,
            stack_map,
            max_stack : self.frames.max_stack().max(self.prologue_stack),
            max_locals : self.slots.max_locals(),
            local_variables,
            source_offsets,
        })
    }

    /// Prepares the live frame for the instruction at `offset`.
    fn enter(&mut self, offset : Offset) -> GeneralResult<()> {
        if let Some(r) = self.regions.handler_at(offset) {
            self.emit_dispatch(r)?;
        }

        let label = Label::Source(offset);
        if self.frames.has(label) {
            if self.reachable {
                self.save(label)?;
            }
            self.frames.load_frame(label)?;
        } else if self.reachable {
            if self.targets.contains(&offset) {
                self.save(label)?;
                self.frames.load_frame(label)?;
            }
        } else {
            // dead so far; a later backward branch or the final backfill supplies the frame
            let snapshot = self.widened();
            self.frames.defer_backfill(label, snapshot, self.last_transfer);
        }
        self.frames.mark_bound(label);
        self.code.bind(label);
        self.reachable = true;

        for r in self.regions.starting_at(offset) {
            self.merge_into_handler(r)?;
        }
        Ok(())
    }

    pub(crate) fn emit(&mut self, insn : Instruction) {
        self.code.emit(insn);
    }

    /// Drops the `aconst_null` that produced the top of the stack, provided no other path
    /// joins in between.
    pub(crate) fn retract_null(&mut self) -> bool {
        let (targets, frames) = (&self.targets, &self.frames);
        self.code.retract(&Instruction::Aconstnull, |label| match label {
            Label::Source(o) => !targets.contains(o) && !frames.has(*label),
            _ => false,
        })
    }

    pub(crate) fn push(&mut self, ty : TypeId) -> GeneralResult<()> {
        self.frames.push(self.types, ty)
    }

    pub(crate) fn pop(&mut self) -> GeneralResult<TypeId> {
        self.frames.pop()
    }

    pub(crate) fn pop_kind(&mut self) -> GeneralResult<(TypeId, StackKind)> {
        let ty = self.pop()?;
        Ok((ty, self.types.stack_kind(ty)?))
    }

    pub(crate) fn pop_reference(&mut self) -> GeneralResult<TypeId> {
        match self.pop_kind()? {
            (ty, StackKind::Reference) => Ok(ty),
            (ty, _) => Err(Error::malformed(format!("expected a reference, found {}", self.types.describe(ty)))),
        }
    }

    /// extra stack slots used by a sequence whose intermediate values are not tracked
    pub(crate) fn note_depth(&mut self, extra : u16) {
        self.frames.note_depth(self.types, extra);
    }

    pub(crate) fn fresh_label(&mut self) -> Label {
        self.next_label += 1;
        Label::Synthetic(self.next_label - 1)
    }

    pub(crate) fn normal(&mut self, kind : StackKind) -> GeneralResult<TypeId> {
        use PrimitiveKind::*;
        Ok(match kind {
            StackKind::Int          => self.types.primitive(Int32),
            StackKind::Long         => self.types.primitive(Int64),
            StackKind::Float        => self.types.primitive(Float32),
            StackKind::Double       => self.types.primitive(Float64),
            StackKind::Reference    => return Err(Error::internal("no primitive for a reference")),
        })
    }

    pub(crate) fn class_index(&mut self, ty : TypeId) -> GeneralResult<u16> {
        let name = self.types.class_name(ty)?;
        self.pool.class(&name)
    }

    pub(crate) fn invoke_static(&mut self, spec : &MethodSpec) -> GeneralResult<()> {
        let index = self.pool.method_ref(&spec.class, &spec.name, &spec.descriptor, false)?;
        self.emit(Instruction::Invokestatic(index));
        Ok(())
    }

    /// The live frame with declared slots at their declared types.
    fn widened(&self) -> Frame {
        let mut frame = self.frames.live().clone();
        for (slot, ty) in frame.locals.iter_mut() {
            if let Some(declared) = self.slots.declared_type(*slot) {
                if self.types.assignable_to(*ty, declared) {
                    *ty = declared;
                }
            }
        }
        frame
    }

    pub(crate) fn save(&mut self, label : Label) -> GeneralResult<()> {
        let frame = self.widened();
        let saved = self.frames.save_frame_with(self.types, label, frame, true, false)?;
        self.settle(label, saved)
    }

    fn settle(&mut self, label : Label, saved : Saved) -> GeneralResult<()> {
        if let Saved::Invalidated { locals, stack } = saved {
            log::warn!("frame at {} changed after its code was translated (locals {:?}, stack {})", label, locals, stack);
            for slot in locals {
                if self.slots.is_variable(slot) {
                    self.materialize(slot)?;
                }
            }
        }
        Ok(())
    }

    fn merge_into_handler(&mut self, region : usize) -> GeneralResult<()> {
        let mut frame = self.widened();
        frame.stack = vec![ self.types.throwable() ];
        let label = Label::Handler(region);
        let saved = self.frames.save_frame_with(self.types, label, frame, true, false)?;
        self.settle(label, saved)
    }

    /// Keeps handler frames of enclosing regions in step with the live locals.
    pub(crate) fn note_locals_changed(&mut self) -> GeneralResult<()> {
        for r in self.regions.protecting(self.current) {
            self.merge_into_handler(r)?;
        }
        Ok(())
    }

    pub(crate) fn branch_to(&mut self, insn : Instruction, label : Label) -> GeneralResult<()> {
        self.save(label)?;
        self.code.branch(insn, label);
        Ok(())
    }

    pub(crate) fn end_block(&mut self, destination : Option<Label>) {
        self.reachable = false;
        self.last_transfer = destination;
    }

    pub(crate) fn jump(&mut self, label : Label) -> GeneralResult<()> {
        self.branch_to(Instruction::Goto(0), label)?;
        self.end_block(Some(label));
        Ok(())
    }

    /// Pops an int and dispatches on it.
    pub(crate) fn switch_to(&mut self, low : i32, targets : Vec<Label>, default : Label) -> GeneralResult<()> {
        match self.pop_kind()? {
            (_, StackKind::Int) => {},
            (ty, _) => return Err(Error::malformed(format!("switch on {}", self.types.describe(ty)))),
        }
        for &t in targets.iter().chain(std::iter::once(&default)) {
            self.save(t)?;
        }
        self.code.table(low, targets, default);
        self.end_block(Some(default));
        Ok(())
    }

    /// Binds a label inside generated code.
    pub(crate) fn bind_label(&mut self, label : Label) -> GeneralResult<()> {
        if self.frames.has(label) {
            if self.reachable {
                self.save(label)?;
            }
            self.frames.load_frame(label)?;
        } else if self.reachable {
            self.save(label)?;
        } else {
            return Err(Error::internal(format!("no frame reaches {}", label)));
        }
        self.frames.mark_bound(label);
        self.code.bind(label);
        self.reachable = true;
        Ok(())
    }

    pub(crate) fn load(&mut self, slot : u16) -> GeneralResult<TypeId> {
        let ty = match self.frames.local(slot) {
            Some(ty) => ty,
            None => self.materialize(slot)?,
        };
        let kind = self.types.stack_kind(ty)?;
        self.emit(jvm::load(kind, slot));
        self.push(ty)?;
        Ok(ty)
    }

    /// Stores a value already popped from the frame.
    pub(crate) fn store(&mut self, slot : u16, ty : TypeId) -> GeneralResult<()> {
        let kind = self.types.stack_kind(ty)?;
        self.emit(jvm::store(kind, slot));
        self.frames.set_local(self.types, slot, ty);
        self.slots.mark_written(slot);
        self.note_locals_changed()
    }

    fn free_temp(&mut self, slot : u16) -> GeneralResult<()> {
        self.slots.free_temp(slot)?;
        self.frames.clear_local(slot);
        Ok(())
    }

    /// Gives a declared slot its declared type everywhere it is unset. Variables also get a
    /// default store in the prologue, the first time only.
    pub(crate) fn materialize(&mut self, slot : u16) -> GeneralResult<TypeId> {
        let declared = self.slots.declared(slot).cloned()
            .ok_or_else(|| Error::internal(format!("slot {} is read before it is written", slot)))?;
        match declared.kind {
            SlotKind::Variable => if self.slots.mark_initialized(slot) {
                log::debug!("default-initializing slot {} as {}", slot, self.types.describe(declared.ty));
                self.emit_default(slot, declared.ty)?;
            },
            SlotKind::Argument => {},
            SlotKind::Synthetic =>
                return Err(Error::internal(format!("synthetic slot {} is read before it is written", slot))),
        }
        self.frames.materialize(self.types, slot, declared.ty);
        Ok(declared.ty)
    }

    fn emit_default(&mut self, slot : u16, ty : TypeId) -> GeneralResult<()> {
        use Instruction::*;
        let kind = self.types.stack_kind(ty)?;
        let (insns, depth) = match (self.types.value_kind(ty), kind) {
            (ValueKind::Value, _) => {
                let name = self.types.class_name(ty)?;
                let class = self.pool.class(&name)?;
                let init = self.pool.method_ref(&name, "<init>", "()V", false)?;
                (vec![ New(class), Dup, Invokespecial(init) ], 2)
            },
            (_, StackKind::Int)         => (vec![ Iconst0 ], 1),
            (_, StackKind::Long)        => (vec![ Lconst0 ], 2),
            (_, StackKind::Float)       => (vec![ Fconst0 ], 1),
            (_, StackKind::Double)      => (vec![ Dconst0 ], 2),
            (_, StackKind::Reference)   => (vec![ Aconstnull ], 1),
        };
        for insn in insns {
            self.code.emit_prologue(insn);
        }
        self.code.emit_prologue(jvm::store(kind, slot));
        self.prologue_stack = self.prologue_stack.max(depth);
        self.slots.mark_written(slot);
        Ok(())
    }

    /// Truncates an int on the stack to a narrower kind.
    fn narrow(&mut self, to : PrimitiveKind) {
        use Instruction::*;
        use PrimitiveKind::*;
        match to {
            Int8            => self.emit(I2b),
            Int16           => self.emit(I2s),
            Char | UInt16   => self.emit(I2c),
            UInt8 => {
                self.emit(Sipush(0xff));
                self.emit(Iand);
                self.note_depth(2);
            },
            _ => {},
        }
    }

    /// Checks that a popped value fits `target`, narrowing ints; yields the type to record.
    fn coerce(&mut self, value : TypeId, target : TypeId) -> GeneralResult<TypeId> {
        let (vk, tk) = (self.types.stack_kind(value)?, self.types.stack_kind(target)?);
        if vk != tk {
            return Err(Error::malformed(format!(
                "{} cannot be stored as {}", self.types.describe(value), self.types.describe(target))));
        }
        match self.types.primitive_kind(target) {
            Some(k) => {
                if self.types.primitive_kind(value) != Some(k) {
                    self.narrow(k);
                }
                Ok(target)
            },
            None if self.types.is_reference(value) => Ok(value),
            None => Ok(target),
        }
    }

    fn store_declared(&mut self, slot : u16) -> GeneralResult<()> {
        let value = self.pop()?;
        let declared = self.slots.declared_type(slot)
            .ok_or_else(|| Error::internal(format!("slot {} is not declared", slot)))?;
        let ty = self.coerce(value, declared)?;
        self.store(slot, ty)
    }

    fn translate_op(&mut self, offset : Offset, op : &Op) -> GeneralResult<()> {
        use Op::*;
        use PrimitiveKind::*;

        match op {
            Nop => Ok(()),
            LoadArg(i) => {
                let slot = self.slots.argument_slot(*i)?;
                self.load(slot).map(|_| ())
            },
            LoadLocal(i) => {
                let slot = self.slots.variable_slot(*i)?;
                self.load(slot).map(|_| ())
            },
            StoreArg(i) => {
                let slot = self.slots.argument_slot(*i)?;
                self.store_declared(slot)
            },
            StoreLocal(i) => {
                let slot = self.slots.variable_slot(*i)?;
                self.store_declared(slot)
            },
            AddressOf(i) => Err(Error::unsupported(format!("taking the address of local {}", i))),
            LoadInt32(v) => {
                let insn = jvm::int_constant(self.pool, *v)?;
                self.emit(insn);
                let ty = self.types.primitive(Int32);
                self.push(ty)
            },
            LoadInt64(v) => {
                let insn = jvm::long_constant(self.pool, *v)?;
                self.emit(insn);
                let ty = self.types.primitive(Int64);
                self.push(ty)
            },
            LoadFloat32(v) => {
                let insn = jvm::float_constant(self.pool, *v)?;
                self.emit(insn);
                let ty = self.types.primitive(Float32);
                self.push(ty)
            },
            LoadFloat64(v) => {
                let insn = jvm::double_constant(self.pool, *v)?;
                self.emit(insn);
                let ty = self.types.primitive(Float64);
                self.push(ty)
            },
            LoadNull => {
                self.emit(Instruction::Aconstnull);
                let ty = self.types.null();
                self.push(ty)
            },
            LoadString(s) => {
                let index = self.pool.string(s)?;
                self.emit(jvm::ldc(index));
                let ty = self.types.reference(&self.config.string_class);
                self.push(ty)
            },
            Dup => {
                let ty = self.frames.peek()?;
                self.emit(jvm::dup(self.types.category(ty)));
                self.push(ty)
            },
            Pop => {
                let ty = self.pop()?;
                self.emit(jvm::pop(self.types.category(ty)));
                Ok(())
            },
            Arithmetic(op) => self.arithmetic(*op),
            Convert { to, checked } => self.convert(*to, *checked),
            Compare { way, unsigned } => self.compare(*way, *unsigned),
            Branch { way, unsigned, target } => self.conditional_branch(*way, *unsigned, *target),
            BranchIf { truth, target } => self.branch_if(*truth, *target),
            Jump(target) => self.jump(Label::Source(*target)),
            Switch(targets) => self.switch(offset, targets),
            Return => self.ret(),
            Throw => {
                self.pop_reference()?;
                self.emit(Instruction::Athrow);
                self.end_block(None);
                Ok(())
            },
            Rethrow => self.rethrow(offset),
            Leave(target) => self.leave(offset, *target),
            EndFinally => self.end_finally(offset),
            EndFilter => self.end_filter(offset),
            Call { method, virtual_call } => self.call(method, *virtual_call),
            NewObject(method) => self.new_object(method),
            LoadField { field, is_static } => self.load_field(field, *is_static),
            StoreField { field, is_static } => self.store_field(field, *is_static),
            NewArray(element) => self.new_array(*element),
            LoadLength => {
                let array = self.pop_reference()?;
                self.check_array(array)?;
                self.emit(Instruction::Arraylength);
                let ty = self.types.primitive(Int32);
                self.push(ty)
            },
            LoadElement => {
                self.pop_index()?;
                let array = self.pop_reference()?;
                let element = self.check_array(array)?;
                self.emit(jvm::array_load(self.types.primitive_kind(element)));
                self.push(element)
            },
            StoreElement => {
                let value = self.pop()?;
                self.pop_index()?;
                let array = self.pop_reference()?;
                let element = self.check_array(array)?;
                if self.types.stack_kind(value)? != self.types.stack_kind(element)? {
                    return Err(Error::malformed(format!(
                        "{} stored into an array of {}", self.types.describe(value), self.types.describe(element))));
                }
                self.emit(jvm::array_store(self.types.primitive_kind(element)));
                Ok(())
            },
            Box(ty) => self.box_value(*ty),
            UnboxAny(ty) => self.unbox_any(*ty),
            CastClass(ty) => {
                self.pop_reference()?;
                self.cast_to(*ty)?;
                self.push(*ty)
            },
            IsInstance(ty) => self.is_instance(*ty),
        }
    }

    fn pop_index(&mut self) -> GeneralResult<()> {
        match self.pop_kind()? {
            (_, StackKind::Int) => Ok(()),
            (ty, _) => Err(Error::malformed(format!("array index of type {}", self.types.describe(ty)))),
        }
    }

    fn check_array(&mut self, array : TypeId) -> GeneralResult<TypeId> {
        self.types.element_of(array)
    }

    fn arithmetic(&mut self, op : ArithmeticOperation) -> GeneralResult<()> {
        use ArithmeticOperation::*;
        use Instruction::*;
        use StackKind::*;

        if op.is_unary() {
            let (ty, kind) = self.pop_kind()?;
            match (op, kind) {
                (Neg, Int)      => self.emit(Ineg),
                (Neg, Long)     => self.emit(Lneg),
                (Neg, Float)    => self.emit(Fneg),
                (Neg, Double)   => self.emit(Dneg),
                (Not, Int) => {
                    self.emit(Iconstm1);
                    self.emit(Ixor);
                    self.note_depth(2);
                },
                (Not, Long) => {
                    let minus_one = jvm::long_constant(self.pool, -1)?;
                    self.emit(minus_one);
                    self.emit(Lxor);
                    self.note_depth(4);
                },
                _ => return Err(Error::malformed(format!("{:?} of {}", op, self.types.describe(ty)))),
            }
            let result = self.normal(kind)?;
            return self.push(result);
        }

        let (b, bk) = self.pop_kind()?;
        let (a, ak) = self.pop_kind()?;

        if op.is_shift() {
            let insn = match (op, ak, bk) {
                (Shl  , Int , Int) => Ishl,
                (Shr  , Int , Int) => Ishr,
                (ShrUn, Int , Int) => Iushr,
                (Shl  , Long, Int) => Lshl,
                (Shr  , Long, Int) => Lshr,
                (ShrUn, Long, Int) => Lushr,
                _ => return Err(Error::malformed(format!(
                    "{:?} of {} by {}", op, self.types.describe(a), self.types.describe(b)))),
            };
            self.emit(insn);
            let result = self.normal(ak)?;
            return self.push(result);
        }

        if ak != bk {
            return Err(Error::malformed(format!(
                "{:?} of {} and {}", op, self.types.describe(a), self.types.describe(b))));
        }

        let insn = match (op, ak) {
            (Add, Int)      => Iadd,
            (Add, Long)     => Ladd,
            (Add, Float)    => Fadd,
            (Add, Double)   => Dadd,
            (Sub, Int)      => Isub,
            (Sub, Long)     => Lsub,
            (Sub, Float)    => Fsub,
            (Sub, Double)   => Dsub,
            (Mul, Int)      => Imul,
            (Mul, Long)     => Lmul,
            (Mul, Float)    => Fmul,
            (Mul, Double)   => Dmul,
            (Div, Int)      => Idiv,
            (Div, Long)     => Ldiv,
            (Div, Float)    => Fdiv,
            (Div, Double)   => Ddiv,
            (Rem, Int)      => Irem,
            (Rem, Long)     => Lrem,
            (Rem, Float)    => Frem,
            (Rem, Double)   => Drem,
            (And, Int)      => Iand,
            (And, Long)     => Land,
            (Or , Int)      => Ior,
            (Or , Long)     => Lor,
            (Xor, Int)      => Ixor,
            (Xor, Long)     => Lxor,
            (DivUn, Int) | (RemUn, Int) | (DivUn, Long) | (RemUn, Long) => {
                let (class, descriptor) = if ak == Int {
                    ("java/lang/Integer", "(II)I")
                } else {
                    ("java/lang/Long", "(JJ)J")
                };
                let name = if op == DivUn { "divideUnsigned" } else { "remainderUnsigned" };
                self.invoke_static(&MethodSpec::new(class, name, descriptor))?;
                let result = self.normal(ak)?;
                return self.push(result);
            },
            _ => return Err(Error::malformed(format!("{:?} of {}", op, self.types.describe(a)))),
        };
        self.emit(insn);
        let result = self.normal(ak)?;
        self.push(result)
    }

    fn convert(&mut self, to : PrimitiveKind, checked : bool) -> GeneralResult<()> {
        use Instruction::*;
        use StackKind::*;

        if checked {
            let name = self.types.primitive(to);
            return Err(Error::unsupported(format!("checked conversion to {}", self.types.describe(name))));
        }

        let (ty, from) = self.pop_kind()?;
        let widen = match (from, to.stack_kind()) {
            (Int, Int) | (Long, Long) | (Float, Float) | (Double, Double) => None,
            (Int   , Long  ) => Some(I2l),
            (Int   , Float ) => Some(I2f),
            (Int   , Double) => Some(I2d),
            (Long  , Int   ) => Some(L2i),
            (Long  , Float ) => Some(L2f),
            (Long  , Double) => Some(L2d),
            (Float , Int   ) => Some(F2i),
            (Float , Long  ) => Some(F2l),
            (Float , Double) => Some(F2d),
            (Double, Int   ) => Some(D2i),
            (Double, Long  ) => Some(D2l),
            (Double, Float ) => Some(D2f),
            _ => return Err(Error::malformed(format!("conversion of {}", self.types.describe(ty)))),
        };
        if let Some(insn) = widen {
            self.emit(insn);
        }

        match (from, to) {
            (_, _) if to.stack_kind() == Int => self.narrow(to),
            // zero extension
            (Int, PrimitiveKind::UInt64) => {
                let mask = jvm::long_constant(self.pool, 0xffff_ffff)?;
                self.emit(mask);
                self.emit(Land);
                self.note_depth(4);
            },
            _ => {},
        }

        let result = self.types.primitive(to);
        self.push(result)
    }

    fn ret(&mut self) -> GeneralResult<()> {
        if self.body.kind == MethodKind::Constructor {
            if let Some(uninit) = self.types.lookup(&AbstractType::UninitializedThis) {
                if self.frames.live().locals.values().any(|&t| t == uninit) {
                    return Err(Error::malformed("constructor returns before calling a base constructor"));
                }
            }
        }
        match self.body.returns {
            Some(returns) => {
                let value = self.pop()?;
                self.coerce(value, returns)?;
                let kind = self.types.stack_kind(returns)?;
                self.emit(jvm::ret(Some(kind)));
            },
            None => self.emit(jvm::ret(None)),
        }
        self.end_block(None);
        Ok(())
    }

    fn method_descriptor(&self, params : &[TypeId], returns : Option<TypeId>) -> GeneralResult<String> {
        let mut out = String::from("(");
        for &p in params {
            out.push_str(&self.types.descriptor(p)?);
        }
        out.push(')');
        match returns {
            Some(r) => out.push_str(&self.types.descriptor(r)?),
            None => out.push('V'),
        }
        Ok(out)
    }

    fn pop_arguments(&mut self, params : &[TypeId]) -> GeneralResult<Vec<TypeId>> {
        let mut values = Vec::with_capacity(params.len());
        for &p in params.iter().rev() {
            let value = self.pop()?;
            if self.types.stack_kind(value)? != self.types.stack_kind(p)? {
                return Err(Error::malformed(format!(
                    "{} passed for a parameter of type {}", self.types.describe(value), self.types.describe(p))));
            }
            values.push(value);
        }
        values.reverse();
        Ok(values)
    }

    fn call(&mut self, method : &MethodRef, virtual_call : bool) -> GeneralResult<()> {
        use Instruction::*;

        let descriptor = self.method_descriptor(&method.params, method.returns)?;
        self.pop_arguments(&method.params)?;
        let class = self.types.class_name(method.owner)?;
        let interface = self.types.is_interface(method.owner);
        let index = self.pool.method_ref(&class, method.jvm_name(), &descriptor, interface)?;

        if method.is_static {
            self.emit(Invokestatic(index));
        } else {
            let receiver = self.pop_reference()?;
            if method.is_constructor() {
                self.emit(Invokespecial(index));
                if self.types.get(receiver) == &AbstractType::UninitializedThis {
                    self.frames.replace_type(receiver, self.body.owner);
                    self.note_locals_changed()?;
                }
            } else if interface {
                let slots = method.params.iter().map(|&p| u16::from(self.types.category(p))).sum::<u16>() + 1;
                let count = u8::try_from(slots)
                    .map_err(|_| Error::unsupported(format!("{} takes too many arguments", method.name)))?;
                self.emit(Invokeinterface { index, count });
            } else if !virtual_call && method.owner != self.body.owner
                    && self.types.assignable_to(self.body.owner, method.owner) {
                self.emit(Invokespecial(index));
            } else {
                self.emit(Invokevirtual(index));
            }
        }

        match method.returns {
            Some(r) => self.push(r),
            None => Ok(()),
        }
    }

    /// Arguments are spilled so that `new; dup` can go beneath them.
    fn new_object(&mut self, method : &MethodRef) -> GeneralResult<()> {
        use Instruction::*;

        let descriptor = self.method_descriptor(&method.params, None)?;
        let values = self.pop_arguments(&method.params)?;

        let mut temps = Vec::with_capacity(values.len());
        for &value in values.iter().rev() {
            let slot = self.slots.get_temp(self.types, value)?;
            self.store(slot, value)?;
            temps.push(slot);
        }

        let class = self.class_index(method.owner)?;
        self.emit(New(class));
        self.emit(Dup);
        for &slot in temps.iter().rev() {
            self.load(slot)?;
        }
        self.note_depth(2);
        for _ in &temps {
            self.pop()?;
        }

        let name = self.types.class_name(method.owner)?;
        let init = self.pool.method_ref(&name, "<init>", &descriptor, false)?;
        self.emit(Invokespecial(init));
        for &slot in temps.iter().rev() {
            self.free_temp(slot)?;
        }
        self.push(method.owner)
    }

    fn field_index(&mut self, field : &FieldRef) -> GeneralResult<u16> {
        let class = self.types.class_name(field.owner)?;
        let descriptor = self.types.descriptor(field.ty)?;
        self.pool.field_ref(&class, &field.name, &descriptor)
    }

    fn load_field(&mut self, field : &FieldRef, is_static : bool) -> GeneralResult<()> {
        let index = self.field_index(field)?;
        if is_static {
            self.emit(Instruction::Getstatic(index));
        } else {
            self.pop_reference()?;
            self.emit(Instruction::Getfield(index));
        }
        self.push(field.ty)
    }

    fn store_field(&mut self, field : &FieldRef, is_static : bool) -> GeneralResult<()> {
        let index = self.field_index(field)?;
        let value = self.pop()?;
        self.coerce(value, field.ty)?;
        if is_static {
            self.emit(Instruction::Putstatic(index));
        } else {
            self.pop_reference()?;
            self.emit(Instruction::Putfield(index));
        }
        Ok(())
    }

    fn new_array(&mut self, element : TypeId) -> GeneralResult<()> {
        self.pop_index()?;
        match self.types.primitive_kind(element) {
            Some(k) => self.emit(Instruction::Newarray(k.array_code())),
            None => {
                let class = self.class_index(element)?;
                self.emit(Instruction::Anewarray(class));
            },
        }
        let array = self.types.array(element, 1);
        self.push(array)
    }

    /// `invokevirtual` of the configured clone helper, leaving a detached copy.
    fn clone_value(&mut self, ty : TypeId) -> GeneralResult<()> {
        let name = self.types.class_name(ty)?;
        let descriptor = format!("()L{};", self.config.object_class);
        let index = self.pool.method_ref(&name, &self.config.value_clone, &descriptor, false)?;
        self.emit(Instruction::Invokevirtual(index));
        let class = self.pool.class(&name)?;
        self.emit(Instruction::Checkcast(class));
        Ok(())
    }

    fn box_value(&mut self, ty : TypeId) -> GeneralResult<()> {
        let value = self.pop()?;
        match self.types.value_kind(ty) {
            ValueKind::Primitive => {
                let kind = self.types.primitive_kind(ty)
                    .ok_or_else(|| Error::internal("primitive without a kind"))?;
                let (wrapper, _) = kind.wrapper();
                let descriptor = format!("({})L{};", kind.descriptor(), wrapper);
                self.invoke_static(&MethodSpec::new(wrapper, "valueOf", &descriptor))?;
            },
            ValueKind::Value => self.clone_value(ty)?,
            // boxing a reference is the identity
            ValueKind::Reference => return self.push(value),
        }
        let boxed = self.types.boxed(ty, false);
        self.push(boxed)
    }

    fn unbox_any(&mut self, ty : TypeId) -> GeneralResult<()> {
        use Instruction::*;

        self.pop_reference()?;
        match self.types.value_kind(ty) {
            ValueKind::Primitive => {
                let kind = self.types.primitive_kind(ty)
                    .ok_or_else(|| Error::internal("primitive without a kind"))?;
                let (wrapper, accessor) = kind.wrapper();
                let class = self.pool.class(wrapper)?;
                self.emit(Checkcast(class));
                let index = self.pool.method_ref(wrapper, accessor, &format!("(){}", kind.descriptor()), false)?;
                self.emit(Invokevirtual(index));
            },
            ValueKind::Value => {
                let class = self.class_index(ty)?;
                self.emit(Checkcast(class));
                self.clone_value(ty)?;
            },
            ValueKind::Reference => self.cast_to(ty)?,
        }
        self.push(ty)
    }

    pub(crate) fn cast_to(&mut self, ty : TypeId) -> GeneralResult<()> {
        match self.types.get(ty) {
            AbstractType::GenericParameter { .. } => Ok(()),
            AbstractType::Value(_) | AbstractType::Primitive(_) =>
                Err(Error::malformed(format!("cast to {}", self.types.describe(ty)))),
            _ => {
                let class = self.class_index(ty)?;
                self.emit(Instruction::Checkcast(class));
                Ok(())
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::*;
    use crate::cil::{ExceptionHandler, HandlerKind, Variable};

    pub struct Fixture {
        pub types : TypeArena,
        pub pool : ConstantPool,
        pub config : Config,
    }

    impl Fixture {
        pub fn new() -> Fixture {
            let config = Config::default();
            Fixture { types : TypeArena::new(&config), pool : ConstantPool::new(), config }
        }

        pub fn int(&mut self) -> TypeId { self.types.primitive(PrimitiveKind::Int32) }

        pub fn body(&mut self, variables : &[TypeId], code : Vec<(Offset, Op)>, handlers : Vec<ExceptionHandler>) -> MethodBody {
            let owner = self.types.declare_class("demo/Sample", None, &[]);
            MethodBody {
                owner,
                name : "run".to_owned(),
                kind : MethodKind::Static,
                params : vec![],
                variables : variables.iter().map(|&ty| Variable { name : None, ty }).collect(),
                returns : None,
                code,
                handlers,
            }
        }

        pub fn translate(&mut self, body : &MethodBody) -> GeneralResult<Method> {
            Translator::new(body, &mut self.types, &mut self.pool, &self.config)?.run(body.name.clone())
        }

        pub fn static_call(&mut self, class : &str, name : &str) -> Op {
            let owner = self.types.declare_class(class, None, &[]);
            Op::Call {
                method : MethodRef { owner, name : name.to_owned(), params : vec![], returns : None, is_static : true },
                virtual_call : false,
            }
        }

        pub fn clause(&self, kind : HandlerKind, try_range : (Offset, Offset), handler : (Offset, Offset), catch_type : Option<TypeId>)
            -> ExceptionHandler
        {
            ExceptionHandler {
                try_start : try_range.0,
                try_end : try_range.1,
                kind,
                handler_start : handler.0,
                handler_end : handler.1,
                filter_start : None,
                catch_type,
            }
        }
    }
}

#[cfg(test)]
use fixture::Fixture;

#[test]
fn test_straight_line_arithmetic() -> GeneralResult<()> {
    use ArithmeticOperation::*;
    use Instruction::*;
    let mut fx = Fixture::new();
    let int = fx.int();
    let body = fx.body(&[ int ], vec![
        (0, Op::LoadInt32(40)),
        (1, Op::LoadInt32(2)),
        (2, Op::Arithmetic(Add)),
        (3, Op::StoreLocal(0)),
        (4, Op::Return),
    ], vec![]);
    let m = fx.translate(&body)?;
    let insns : Vec<_> = m.code.iter().map(|(_, i)| i.clone()).collect();
    assert_eq!(insns, vec![ Bipush(40), Iconst2, Iadd, Istore0, Return ]);
    assert_eq!(m.max_stack, 2);
    assert_eq!(m.max_locals, 1);
    assert!(m.stack_map.is_empty());
    Ok(())
}

#[test]
fn test_store_narrows() -> GeneralResult<()> {
    use Instruction::*;
    let mut fx = Fixture::new();
    let byte = fx.types.primitive(PrimitiveKind::UInt8);
    let body = fx.body(&[ byte ], vec![
        (0, Op::LoadInt32(300)),
        (1, Op::StoreLocal(0)),
        (2, Op::Return),
    ], vec![]);
    let m = fx.translate(&body)?;
    let insns : Vec<_> = m.code.iter().map(|(_, i)| i.clone()).collect();
    assert_eq!(insns, vec![ Sipush(300), Sipush(255), Iand, Istore0, Return ]);
    Ok(())
}

#[test]
fn test_unsigned_division_uses_helper() -> GeneralResult<()> {
    let mut fx = Fixture::new();
    let body = fx.body(&[], vec![
        (0, Op::LoadInt64(7)),
        (1, Op::LoadInt64(2)),
        (2, Op::Arithmetic(ArithmeticOperation::DivUn)),
        (3, Op::Pop),
        (4, Op::Return),
    ], vec![]);
    let m = fx.translate(&body)?;
    let helper = fx.pool.method_ref("java/lang/Long", "divideUnsigned", "(JJ)J", false)?;
    assert!(m.code.iter().any(|(_, i)| i == &Instruction::Invokestatic(helper)));
    assert!(m.code.iter().any(|(_, i)| i == &Instruction::Pop2));
    Ok(())
}

#[test]
fn test_new_object_spills_arguments() -> GeneralResult<()> {
    use Instruction::*;
    let mut fx = Fixture::new();
    let int = fx.int();
    let long = fx.types.primitive(PrimitiveKind::Int64);
    let point = fx.types.declare_class("demo/Point", None, &[]);
    let ctor = MethodRef { owner : point, name : ".ctor".to_owned(), params : vec![ int, long ], returns : None, is_static : false };
    let body = fx.body(&[ point ], vec![
        (0, Op::LoadInt32(1)),
        (1, Op::LoadInt64(2)),
        (2, Op::NewObject(ctor)),
        (3, Op::StoreLocal(0)),
        (4, Op::Return),
    ], vec![]);
    let m = fx.translate(&body)?;
    let insns : Vec<_> = m.code.iter().map(|(_, i)| i.clone()).collect();
    // the long lands in the first temp above the variable, the int above it
    assert_eq!(&insns[2..4], &[ Lstore1, Istore3 ]);
    assert!(matches!(insns[4], New(_)));
    assert_eq!(&insns[5..8], &[ Dup, Iload3, Lload1 ]);
    assert!(matches!(insns[8], Invokespecial(_)));
    assert_eq!(insns[9], Astore0);
    assert_eq!(m.max_locals, 4);
    assert_eq!(m.max_stack, 5);
    Ok(())
}

#[test]
fn test_constructor_initializes_this() -> GeneralResult<()> {
    let mut fx = Fixture::new();
    let mut body = fx.body(&[], vec![], vec![]);
    let object = fx.types.object();
    body.kind = MethodKind::Constructor;
    body.name = ".ctor".to_owned();
    let base = MethodRef { owner : object, name : ".ctor".to_owned(), params : vec![], returns : None, is_static : false };
    body.code = vec![
        (0, Op::LoadArg(0)),
        (1, Op::Call { method : base, virtual_call : false }),
        (2, Op::Return),
    ];
    let m = fx.translate(&body)?;
    assert_eq!(m.code.len(), 3);
    body.code = vec![ (0, Op::Return) ];
    assert!(fx.translate(&body).is_err());
    Ok(())
}

#[test]
fn test_address_of_is_unsupported() {
    use crate::error::ErrorKind;
    let mut fx = Fixture::new();
    let int = fx.int();
    let body = fx.body(&[ int ], vec![ (0, Op::AddressOf(0)), (1, Op::Return) ], vec![]);
    assert_eq!(fx.translate(&body).map(|_| ()).map_err(|e| e.kind()), Err(ErrorKind::Unsupported));
}

#[test]
fn test_falling_off_the_end_is_malformed() {
    let mut fx = Fixture::new();
    let body = fx.body(&[], vec![ (0, Op::Nop) ], vec![]);
    assert!(fx.translate(&body).is_err());
}

#[test]
fn test_unreachable_code_starts_from_declared_types() -> GeneralResult<()> {
    use crate::frames::VerificationType;
    let mut fx = Fixture::new();
    let object = fx.types.object();
    let body = fx.body(&[ object ], vec![
        (0, Op::LoadString("s".to_owned())),
        (1, Op::StoreLocal(0)),
        (2, Op::Jump(5)),
        (3, Op::LoadLocal(0)),
        (4, Op::Pop),
        (5, Op::LoadInt32(1)),
        (6, Op::BranchIf { truth : true, target : 3 }),
        (7, Op::Return),
    ], vec![]);
    let m = fx.translate(&body)?;
    // the later back edge agrees with the state 3 was translated against
    assert!(!m.code.iter().any(|(_, i)| *i == Instruction::Aconstnull));
    let addr = m.source_offsets[&3];
    let entry = m.stack_map.iter().find(|e| usize::from(e.offset) == addr)
        .ok_or_else(|| Error::internal("no frame at the loop head"))?;
    let erased = fx.pool.class("java/lang/Object")?;
    assert_eq!(entry.locals, vec![ VerificationType::Object(erased) ]);
    Ok(())
}
