//! Exception regions and their reconstruction on the JVM.
//!
//! Clauses that share a protected range form one region. On the JVM each region becomes a
//! single exception-table entry catching everything, whose handler calls the exception mapper
//! and then tests the clauses in order. A `leave` that crosses a finally clause becomes a throw
//! of a sentinel carrying the destination index; the `endfinally` at the end of the clause
//! rethrows genuine exceptions and switches on sentinels.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use classfile_parser::code_attribute::Instruction;

use crate::cil::{HandlerKind, MethodBody, Offset, Op};
use crate::code::Label;
use crate::config::{Config, MethodSpec};
use crate::error::{Error, GeneralResult};
use crate::jvm;
use crate::locals::SlotAllocator;
use crate::translate::Translator;
use crate::types::{AbstractType, GenericRole, PrimitiveKind, StackKind, TypeArena, TypeId, ValueKind};

#[derive(Clone, Debug, PartialEq)]
pub enum ClauseKind {
    Catch(TypeId),
    Filter { condition : Offset },
    Finally,
    Fault,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Clause {
    pub kind : ClauseKind,
    /// first instruction of the clause, which for a filter is its condition
    pub start : Offset,
    pub end : Offset,
    pub handler_start : Offset,
    /// holds the caught exception for `rethrow`
    pub rethrow_slot : Option<u16>,
}

impl Clause {
    fn is_final(&self) -> bool {
        match self.kind {
            ClauseKind::Finally | ClauseKind::Fault => true,
            _ => false,
        }
    }

    fn contains(&self, offset : Offset) -> bool {
        self.start <= offset && offset < self.end
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TryRegion {
    pub start : Offset,
    pub end : Offset,
    pub clauses : Vec<Clause>,
    /// destinations of `leave`s relayed through this region's finally clause, by index
    pub leave_targets : Vec<Offset>,
    pub finally_slot : Option<u16>,
    pub filter_slot : Option<u16>,
}

impl TryRegion {
    /// where the dispatch code is placed
    pub fn handler_offset(&self) -> Offset {
        self.clauses.first().map(|c| c.start).unwrap_or(self.end)
    }

    /// end of the last clause
    pub fn span_end(&self) -> Offset {
        self.clauses.last().map(|c| c.end).unwrap_or(self.end)
    }

    fn span_len(&self) -> usize { self.span_end() - self.start }

    pub fn final_clause(&self) -> Option<(usize, &Clause)> {
        self.clauses.iter().enumerate().last().filter(|(_, c)| c.is_final())
    }

    fn finally_clause(&self) -> Option<(usize, &Clause)> {
        self.final_clause().filter(|(_, c)| c.kind == ClauseKind::Finally)
    }

    /// every way control can leave the finally clause, rethrowing first
    pub fn resumptions(&self) -> Vec<Resumption> {
        std::iter::once(Resumption::Rethrow)
            .chain(self.leave_targets.iter().enumerate().map(|(index, &target)| Resumption::Leave { index, target }))
            .collect()
    }

    fn has_filter(&self) -> bool {
        self.clauses.iter().any(|c| match c.kind { ClauseKind::Filter { .. } => true, _ => false })
    }

    /// the ranges a nested region may lie within
    fn parts(&self) -> impl Iterator<Item=(Offset, Offset)> + '_ {
        std::iter::once((self.start, self.end)).chain(self.clauses.iter().map(|c| (c.start, c.end)))
    }
}

/// What happens when a finally clause completes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Resumption {
    /// the clause was entered by an exception
    Rethrow,
    /// the clause was entered by the `index`th relayed leave
    Leave { index : usize, target : Offset },
}

/// How a `leave` reaches its destination.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Leave {
    Direct,
    /// through the finally clause of `region`, carrying destination `index`
    Relay { region : usize, index : usize },
}

/// All regions of a method, innermost first. A region's position is its identity in labels.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegionTree {
    regions : Vec<TryRegion>,
}

fn check_offset(body : &MethodBody, offset : Offset, what : &str) -> GeneralResult<()> {
    if body.is_boundary(offset) {
        Ok(())
    } else {
        Err(Error::malformed(format!("{} at {} is not an instruction", what, offset)))
    }
}

fn check_end(body : &MethodBody, offset : Offset, what : &str) -> GeneralResult<Offset> {
    let end = body.normalize_end(offset);
    if end == body.end() || body.is_boundary(end) {
        Ok(end)
    } else {
        Err(Error::malformed(format!("{} at {} is not an instruction", what, offset)))
    }
}

fn within(inner : (Offset, Offset), outer : (Offset, Offset)) -> bool {
    outer.0 <= inner.0 && inner.1 <= outer.1
}

impl RegionTree {
    pub fn build(body : &MethodBody, types : &mut TypeArena, config : &Config, slots : &mut SlotAllocator)
        -> GeneralResult<RegionTree>
    {
        let mut grouped : BTreeMap<(Offset, Offset), Vec<Clause>> = BTreeMap::new();

        for h in &body.handlers {
            check_offset(body, h.try_start, "protected range")?;
            check_offset(body, h.handler_start, "handler")?;
            let try_end = check_end(body, h.try_end, "end of protected range")?;
            let end = check_end(body, h.handler_end, "end of handler")?;
            if h.try_start >= try_end || h.handler_start >= end {
                return Err(Error::malformed(format!("empty range in handler at {}", h.handler_start)));
            }

            let (kind, start) = match h.kind {
                HandlerKind::Catch => {
                    let ty = h.catch_type
                        .ok_or_else(|| Error::malformed(format!("catch at {} has no type", h.handler_start)))?;
                    check_catch_type(types, config, ty)?;
                    (ClauseKind::Catch(ty), h.handler_start)
                },
                HandlerKind::Filter => {
                    let condition = h.filter_start
                        .ok_or_else(|| Error::malformed(format!("filter at {} has no condition", h.handler_start)))?;
                    check_offset(body, condition, "filter")?;
                    if condition >= h.handler_start {
                        return Err(Error::malformed(format!("filter at {} follows its handler", condition)));
                    }
                    (ClauseKind::Filter { condition }, condition)
                },
                HandlerKind::Finally => (ClauseKind::Finally, h.handler_start),
                HandlerKind::Fault => (ClauseKind::Fault, h.handler_start),
            };

            grouped.entry((h.try_start, try_end)).or_default().push(Clause {
                kind,
                start,
                end,
                handler_start : h.handler_start,
                rethrow_slot : None,
            });
        }

        let mut regions = Vec::with_capacity(grouped.len());
        for ((start, end), mut clauses) in grouped {
            clauses.sort_by_key(|c| c.start);
            if clauses[0].start < end {
                return Err(Error::malformed(format!("handler at {} lies inside its protected range", clauses[0].start)));
            }
            for pair in clauses.windows(2) {
                if pair[0].end != pair[1].start {
                    return Err(Error::malformed(format!(
                        "clauses at {} and {} are not contiguous", pair[0].start, pair[1].start)));
                }
            }
            if clauses.iter().rev().skip(1).any(Clause::is_final) {
                return Err(Error::malformed(format!(
                    "region at {} has a finally or fault clause that is not its last", start)));
            }
            regions.push(TryRegion {
                start,
                end,
                clauses,
                leave_targets : Vec::new(),
                finally_slot : None,
                filter_slot : None,
            });
        }

        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                let (sa, sb) = ((a.start, a.span_end()), (b.start, b.span_end()));
                let disjoint = sa.1 <= sb.0 || sb.1 <= sa.0;
                let nested = b.parts().any(|p| within(sa, p)) || a.parts().any(|p| within(sb, p));
                if !disjoint && !nested {
                    return Err(Error::malformed(format!("regions at {} and {} overlap", a.start, b.start)));
                }
            }
        }

        regions.sort_by_key(|r| (r.span_len(), r.start));

        let mut tree = RegionTree { regions };
        tree.allocate_slots(body, types, slots)?;
        tree.plan_leaves(body);

        log::debug!("{} exception regions, {} relayed leave targets",
            tree.regions.len(), tree.regions.iter().map(|r| r.leave_targets.len()).sum::<usize>());

        Ok(tree)
    }

    fn allocate_slots(&mut self, body : &MethodBody, types : &mut TypeArena, slots : &mut SlotAllocator) -> GeneralResult<()> {
        let throwable = types.throwable();

        for r in 0..self.regions.len() {
            let nested_in_final = match self.regions[r].final_clause() {
                Some((_, fin)) => {
                    let range = (fin.start, fin.end);
                    self.regions.iter().any(|o| within((o.start, o.span_end()), range))
                },
                None => false,
            };
            if nested_in_final {
                self.regions[r].finally_slot = Some(slots.allocate_synthetic(types, throwable)?);
            }
            if self.regions[r].has_filter() {
                self.regions[r].filter_slot = Some(slots.allocate_synthetic(types, throwable)?);
            }
        }

        for (offset, op) in &body.code {
            if op != &Op::Rethrow {
                continue;
            }
            let (r, k) = self.handling_clause(*offset)
                .ok_or_else(|| Error::malformed(format!("rethrow at {} is outside a catch clause", offset)))?;
            if let ClauseKind::Catch(_) = self.regions[r].clauses[k].kind {
                if self.regions[r].clauses[k].rethrow_slot.is_none() {
                    self.regions[r].clauses[k].rethrow_slot = Some(slots.allocate_synthetic(types, throwable)?);
                }
            }
        }

        Ok(())
    }

    /// innermost catch or filter handler containing `offset`
    fn handling_clause(&self, offset : Offset) -> Option<(usize, usize)> {
        self.regions.iter().enumerate().find_map(|(r, region)| {
            region.clauses.iter().position(|c| match c.kind {
                ClauseKind::Catch(_) => c.contains(offset),
                ClauseKind::Filter { .. } => c.handler_start <= offset && offset < c.end,
                _ => false,
            }).map(|k| (r, k))
        })
    }

    /// innermost region whose finally clause a `leave` from `from` to `target` must run
    fn route(&self, from : Offset, target : Offset) -> Option<usize> {
        self.regions.iter().position(|region| match region.finally_clause() {
            Some((_, fin)) => {
                let guarded = region.start <= from && from < fin.start;
                let inside = region.start <= target && target < fin.start;
                guarded && !inside
            },
            None => false,
        })
    }

    fn plan_leaves(&mut self, body : &MethodBody) {
        for (offset, op) in &body.code {
            if let Op::Leave(target) = op {
                let mut from = *offset;
                while let Some(r) = self.route(from, *target) {
                    let region = &mut self.regions[r];
                    if !region.leave_targets.contains(target) {
                        region.leave_targets.push(*target);
                    }
                    from = region.finally_clause().map(|(_, fin)| fin.start).unwrap_or(from);
                }
            }
        }
    }

    pub fn plan_leave(&self, from : Offset, target : Offset) -> GeneralResult<Leave> {
        match self.route(from, target) {
            None => Ok(Leave::Direct),
            Some(region) => self.regions[region].leave_targets.iter().position(|&t| t == target)
                .map(|index| Leave::Relay { region, index })
                .ok_or_else(|| Error::internal(format!("leave to {} was not planned through region {}", target, region))),
        }
    }

    pub fn len(&self) -> usize { self.regions.len() }
    pub fn is_empty(&self) -> bool { self.regions.is_empty() }

    pub fn get(&self, region : usize) -> GeneralResult<&TryRegion> {
        self.regions.get(region).ok_or_else(|| Error::internal(format!("no region {}", region)))
    }

    pub fn iter(&self) -> impl Iterator<Item=&TryRegion> { self.regions.iter() }

    pub fn handler_at(&self, offset : Offset) -> Option<usize> {
        self.regions.iter().position(|r| r.handler_offset() == offset)
    }

    /// regions whose protected range begins at `offset`, outermost first
    pub fn starting_at(&self, offset : Offset) -> Vec<usize> {
        (0..self.regions.len()).rev().filter(|&r| self.regions[r].start == offset).collect()
    }

    pub fn protecting(&self, offset : Offset) -> Vec<usize> {
        (0..self.regions.len())
            .filter(|&r| self.regions[r].start <= offset && offset < self.regions[r].end)
            .collect()
    }

    fn final_clause_at(&self, offset : Offset) -> GeneralResult<(usize, usize)> {
        self.regions.iter().enumerate()
            .find_map(|(r, region)| region.final_clause().filter(|(_, c)| c.contains(offset)).map(|(k, _)| (r, k)))
            .ok_or_else(|| Error::malformed(format!("endfinally at {} is outside a finally or fault clause", offset)))
    }

    fn filter_at(&self, offset : Offset) -> GeneralResult<(usize, usize)> {
        self.regions.iter().enumerate()
            .find_map(|(r, region)| region.clauses.iter().position(|c| match c.kind {
                ClauseKind::Filter { condition } => condition <= offset && offset < c.handler_start,
                _ => false,
            }).map(|k| (r, k)))
            .ok_or_else(|| Error::malformed(format!("endfilter at {} is outside a filter", offset)))
    }

    fn rethrow_slot(&self, offset : Offset) -> GeneralResult<u16> {
        let (r, k) = self.handling_clause(offset)
            .ok_or_else(|| Error::malformed(format!("rethrow at {} is outside a catch clause", offset)))?;
        let region = &self.regions[r];
        match region.clauses[k].kind {
            ClauseKind::Filter { .. } => region.filter_slot,
            _ => region.clauses[k].rethrow_slot,
        }.ok_or_else(|| Error::internal(format!("no slot holds the exception rethrown at {}", offset)))
    }
}

fn check_catch_type(types : &TypeArena, config : &Config, ty : TypeId) -> GeneralResult<()> {
    match types.get(ty) {
        AbstractType::GenericParameter { .. } => Ok(()),
        _ if types.value_kind(ty) != ValueKind::Reference =>
            Err(Error::malformed(format!("catch of non-reference type {}", types.describe(ty)))),
        _ => {
            let name = types.class_name(ty)?;
            if config.is_host_alias(&name) {
                Err(Error::unsupported(format!("catching {}, which the JVM raises under another name", name)))
            } else {
                Ok(())
            }
        },
    }
}

impl<'a> Translator<'a> {
    /// `dup` the exception on top of the stack into `slot`.
    fn stash(&mut self, slot : u16) -> GeneralResult<()> {
        let ty = self.frames.peek()?;
        self.emit(Instruction::Dup);
        self.note_depth(1);
        self.store(slot, ty)
    }

    fn is_universal(&self, ty : TypeId) -> GeneralResult<bool> {
        match self.types.get(ty) {
            // a resolved parameter in catch position erases to the exception root
            AbstractType::GenericParameter { role : GenericRole::Resolved, .. } => Ok(true),
            AbstractType::GenericParameter { .. } => Ok(false),
            _ => Ok(self.config.is_universal_exception(&self.types.class_name(ty)?)),
        }
    }

    /// The handler of region `r`: map the exception, then test each clause in order.
    pub(crate) fn emit_dispatch(&mut self, r : usize) -> GeneralResult<()> {
        use Instruction::*;

        if self.reachable {
            return Err(Error::malformed(format!("control falls into the handler at {}", self.current)));
        }
        let region = self.regions.get(r)?.clone();
        let first_is_final = region.clauses.first().map(Clause::is_final).unwrap_or(false);

        self.bind_label(Label::Handler(r))?;
        if !first_is_final {
            self.pop_reference()?;
            let mapper = self.config.exception_mapper.clone();
            self.invoke_static(&mapper)?;
            let throwable = self.types.throwable();
            self.push(throwable)?;
        }

        // a clause that jumps away unconditionally leaves no fall-through state for the next
        let n = region.clauses.len();
        let last = if region.clauses.last().map(Clause::is_final).unwrap_or(false) { n - 1 } else { n };
        for k in 1..=last {
            self.save(Label::Dispatch(r, k))?;
        }

        for (k, clause) in region.clauses.iter().enumerate() {
            self.bind_label(Label::Dispatch(r, k))?;
            let next = Label::Dispatch(r, k + 1);
            match clause.kind {
                ClauseKind::Catch(ty) if self.is_universal(ty)? => {
                    if let Some(slot) = clause.rethrow_slot {
                        self.stash(slot)?;
                    }
                },
                ClauseKind::Catch(ty) => {
                    if let AbstractType::GenericParameter { name, role : GenericRole::Unresolved } = self.types.get(ty).clone() {
                        let helper = self.config.generic_catch.clone();
                        let index = self.pool.string(&name)?;
                        self.emit(Dup);
                        self.emit(jvm::ldc(index));
                        self.note_depth(2);
                        self.invoke_static(&helper)?;
                    } else {
                        let class = self.class_index(ty)?;
                        self.emit(Dup);
                        self.emit(Instanceof(class));
                        self.note_depth(1);
                        self.branch_to(Ifeq(0), next)?;
                        self.emit(Checkcast(class));
                        self.pop()?;
                        self.push(ty)?;
                        if let Some(slot) = clause.rethrow_slot {
                            self.stash(slot)?;
                        }
                        self.jump(Label::Source(clause.start))?;
                        continue;
                    }
                    // the helper's result only decides the match
                    self.branch_to(Ifnull(0), next)?;
                    if let Some(slot) = clause.rethrow_slot {
                        self.stash(slot)?;
                    }
                },
                ClauseKind::Filter { .. } => {
                    let slot = region.filter_slot
                        .ok_or_else(|| Error::internal(format!("filter in region {} has no slot", r)))?;
                    self.stash(slot)?;
                },
                ClauseKind::Finally | ClauseKind::Fault => {
                    if let Some(slot) = region.finally_slot {
                        let ty = self.pop()?;
                        self.store(slot, ty)?;
                    }
                },
            }
            self.jump(Label::Source(clause.start))?;
        }

        if last == n {
            self.bind_label(Label::Dispatch(r, n))?;
            self.pop_reference()?;
            self.emit(Athrow);
            self.end_block(None);
        }
        Ok(())
    }

    /// Empties the stack and transfers to `target`, relaying through any finally clauses
    /// in between.
    pub(crate) fn emit_leave(&mut self, from : Offset, target : Offset) -> GeneralResult<()> {
        while !self.frames.is_stack_empty() {
            let ty = self.pop()?;
            self.emit(jvm::pop(self.types.category(ty)));
        }
        match self.regions.plan_leave(from, target)? {
            Leave::Direct => self.jump(Label::Source(target)),
            Leave::Relay { region, index } => {
                let k = self.regions.get(region)?.final_clause().map(|(k, _)| k)
                    .ok_or_else(|| Error::internal(format!("region {} has no finally clause", region)))?;
                let value = i32::try_from(index)
                    .map_err(|_| Error::unsupported("too many leave destinations"))?;
                let insn = jvm::int_constant(self.pool, value)?;
                self.emit(insn);
                self.note_depth(1);
                let sentinel = &self.config.leave_sentinel;
                let factory = MethodSpec::new(&sentinel.class, &sentinel.factory, &self.config.sentinel_factory_descriptor());
                self.invoke_static(&factory)?;
                let ty = self.types.reference(&self.config.leave_sentinel.class);
                self.push(ty)?;
                self.jump(Label::Dispatch(region, k))
            },
        }
    }

    pub(crate) fn leave(&mut self, offset : Offset, target : Offset) -> GeneralResult<()> {
        self.emit_leave(offset, target)
    }

    /// `endfinally` and `endfault`. The in-flight object is rethrown unless it is a leave
    /// sentinel, whose index picks the destination to resume at.
    pub(crate) fn end_finally(&mut self, offset : Offset) -> GeneralResult<()> {
        use Instruction::*;

        let (r, k) = self.regions.final_clause_at(offset)?;
        let region = self.regions.get(r)?.clone();
        let clause = &region.clauses[k];

        // the in-flight object is the bottom item unless it was parked in a slot
        let keep = if region.finally_slot.is_some() { 0 } else { 1 };
        while self.frames.live().stack.len() > keep {
            let ty = self.pop()?;
            self.emit(jvm::pop(self.types.category(ty)));
        }
        if let Some(slot) = region.finally_slot {
            self.load(slot)?;
        }

        let resumptions = if clause.kind == ClauseKind::Fault { vec![ Resumption::Rethrow ] } else { region.resumptions() };
        let targets = resumptions.len() - 1;
        if targets == 0 {
            self.pop_reference()?;
            self.emit(Athrow);
            self.end_block(None);
            return Ok(());
        }

        let sentinel = self.pool.class(&self.config.leave_sentinel.class)?;
        let selected = self.fresh_label();
        self.emit(Dup);
        self.emit(Instanceof(sentinel));
        self.note_depth(1);
        self.branch_to(Ifne(0), selected)?;

        // resumption code is shared by every endfinally of the clause
        let first = self.resumed.insert(r);
        for resumption in resumptions {
            match resumption {
                Resumption::Rethrow => {
                    self.pop_reference()?;
                    self.emit(Athrow);
                    self.end_block(None);
                    self.bind_label(selected)?;
                    if targets == 1 {
                        let ty = self.pop()?;
                        self.emit(jvm::pop(self.types.category(ty)));
                        if !first {
                            return self.jump(Label::Resume(r, 0));
                        }
                    } else {
                        self.emit(Checkcast(sentinel));
                        let spec = &self.config.leave_sentinel;
                        let accessor = self.pool.method_ref(&spec.class, &spec.accessor, "()I", false)?;
                        self.emit(Invokevirtual(accessor));
                        self.pop()?;
                        let int = self.types.primitive(PrimitiveKind::Int32);
                        self.push(int)?;
                        let labels = (0..targets).map(|i| Label::Resume(r, i)).collect();
                        self.switch_to(0, labels, Label::Resume(r, targets - 1))?;
                        if !first {
                            return Ok(());
                        }
                    }
                },
                Resumption::Leave { index, target } => {
                    self.bind_label(Label::Resume(r, index))?;
                    self.emit_leave(clause.start, target)?;
                },
            }
        }
        Ok(())
    }

    pub(crate) fn end_filter(&mut self, offset : Offset) -> GeneralResult<()> {
        use Instruction::*;

        let (r, k) = self.regions.filter_at(offset)?;
        let region = self.regions.get(r)?.clone();
        let handler_start = region.clauses[k].handler_start;
        let slot = region.filter_slot
            .ok_or_else(|| Error::internal(format!("filter in region {} has no slot", r)))?;

        match self.pop_kind()? {
            (_, StackKind::Int) => {},
            (ty, _) => return Err(Error::malformed(format!("filter yields {}", self.types.describe(ty)))),
        }
        let reject = Label::FilterReject(r, k);
        self.branch_to(Ifeq(0), reject)?;
        self.load(slot)?;
        self.jump(Label::Source(handler_start))?;

        self.bind_label(reject)?;
        self.load(slot)?;
        self.jump(Label::Dispatch(r, k + 1))
    }

    pub(crate) fn rethrow(&mut self, offset : Offset) -> GeneralResult<()> {
        let slot = self.regions.rethrow_slot(offset)?;
        self.load(slot)?;
        self.pop_reference()?;
        self.emit(Instruction::Athrow);
        self.end_block(None);
        Ok(())
    }
}

#[cfg(test)]
fn tree(fx : &mut crate::translate::fixture::Fixture, body : &MethodBody) -> GeneralResult<RegionTree> {
    let mut slots = SlotAllocator::new();
    RegionTree::build(body, &mut fx.types, &fx.config, &mut slots)
}

#[test]
fn test_clauses_group_and_sort() -> GeneralResult<()> {
    use crate::translate::fixture::Fixture;
    use HandlerKind::*;
    let mut fx = Fixture::new();
    let a = fx.types.declare_class("demo/A", fx.types.exception_root(), &[]);
    let code = (0..8).map(|o| (o, Op::Nop)).collect();
    let finally = fx.clause(Finally, (0, 2), (4, 6), None);
    let catch = fx.clause(Catch, (0, 2), (2, 4), Some(a));
    let body = fx.body(&[], code, vec![ finally, catch ]);
    let t = tree(&mut fx, &body)?;
    assert_eq!(t.len(), 1);
    let region = t.get(0)?;
    assert_eq!(region.clauses.iter().map(|c| c.start).collect::<Vec<_>>(), vec![ 2, 4 ]);
    assert_eq!(region.handler_offset(), 2);
    assert_eq!(region.final_clause().map(|(k, _)| k), Some(1));
    Ok(())
}

#[test]
fn test_region_validation() {
    use crate::error::ErrorKind;
    use crate::translate::fixture::Fixture;
    use HandlerKind::*;
    let mut fx = Fixture::new();
    let code : Vec<_> = (0..8).map(|o| (o, Op::Nop)).collect();
    let int = fx.int();
    let alias = fx.types.declare_class("system/NullReferenceException", fx.types.exception_root(), &[]);

    let kind = |fx : &mut Fixture, handlers| {
        let body = fx.body(&[], code.clone(), handlers);
        tree(fx, &body).map(|_| ()).map_err(|e| e.kind())
    };

    let untyped = fx.clause(Catch, (0, 2), (2, 4), None);
    assert_eq!(kind(&mut fx, vec![ untyped ]), Err(ErrorKind::Malformed));
    let primitive = fx.clause(Catch, (0, 2), (2, 4), Some(int));
    assert_eq!(kind(&mut fx, vec![ primitive ]), Err(ErrorKind::Malformed));
    let aliased = fx.clause(Catch, (0, 2), (2, 4), Some(alias));
    assert_eq!(kind(&mut fx, vec![ aliased ]), Err(ErrorKind::Unsupported));
    let gap = vec![ fx.clause(Fault, (0, 2), (2, 3), None), fx.clause(Finally, (0, 2), (4, 6), None) ];
    assert_eq!(kind(&mut fx, gap), Err(ErrorKind::Malformed));
    let overlap = vec![ fx.clause(Finally, (0, 3), (3, 5), None), fx.clause(Fault, (2, 4), (5, 6), None) ];
    assert_eq!(kind(&mut fx, overlap), Err(ErrorKind::Malformed));
}

#[test]
fn test_leave_relays_through_nested_finally() -> GeneralResult<()> {
    use crate::translate::fixture::Fixture;
    use HandlerKind::*;
    let mut fx = Fixture::new();
    // inner try 0..2 finally 2..4, outer try 0..4 finally 4..6, leave from 1 to 7
    let mut code : Vec<_> = (0..8).map(|o| (o, Op::Nop)).collect();
    code[1].1 = Op::Leave(7);
    code[3].1 = Op::EndFinally;
    code[5].1 = Op::EndFinally;
    let handlers = vec![
        fx.clause(Finally, (0, 4), (4, 6), None),
        fx.clause(Finally, (0, 2), (2, 4), None),
    ];
    let body = fx.body(&[], code, handlers);
    let t = tree(&mut fx, &body)?;
    assert_eq!(t.get(0)?.end, 2);
    assert_eq!(t.starting_at(0), vec![ 1, 0 ]);
    assert_eq!(t.plan_leave(1, 7)?, Leave::Relay { region : 0, index : 0 });
    assert_eq!(t.plan_leave(2, 7)?, Leave::Relay { region : 1, index : 0 });
    assert_eq!(t.plan_leave(4, 7)?, Leave::Direct);
    assert_eq!(t.get(1)?.leave_targets, vec![ 7 ]);
    // the inner region nests in the outer's protected range, not its finally
    assert_eq!(t.get(1)?.finally_slot, None);
    Ok(())
}

#[test]
fn test_rethrow_needs_a_catch() -> GeneralResult<()> {
    use crate::translate::fixture::Fixture;
    use HandlerKind::*;
    let mut fx = Fixture::new();
    let object = fx.types.object();
    let mut code : Vec<_> = (0..6).map(|o| (o, Op::Nop)).collect();
    code[3].1 = Op::Rethrow;
    let handlers = vec![ fx.clause(Catch, (0, 2), (2, 4), Some(object)) ];
    let body = fx.body(&[], code.clone(), handlers.clone());
    let t = tree(&mut fx, &body)?;
    assert!(t.get(0)?.clauses[0].rethrow_slot.is_some());

    code[3].1 = Op::Nop;
    code[5].1 = Op::Rethrow;
    let body = fx.body(&[], code, handlers);
    assert!(tree(&mut fx, &body).is_err());
    Ok(())
}

#[cfg(test)]
use crate::translate::fixture::Fixture;

#[test]
fn test_final_clause_must_come_last() {
    use crate::error::ErrorKind;
    use HandlerKind::*;
    let mut fx = Fixture::new();
    let a = fx.types.declare_class("demo/A", fx.types.exception_root(), &[]);
    let mut code : Vec<_> = (0..6).map(|o| (o, Op::Nop)).collect();
    code.push((6, Op::Return));
    let handlers = vec![ fx.clause(Finally, (0, 2), (2, 4), None), fx.clause(Catch, (0, 2), (4, 6), Some(a)) ];
    let body = fx.body(&[], code, handlers);
    let e = tree(&mut fx, &body).map(|_| ()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Malformed);
    assert!(e.to_string().contains("not its last"));
}

#[cfg(test)]
fn catching(fx : &mut Fixture, ty : TypeId) -> GeneralResult<Vec<Instruction>> {
    let code = vec![ (0, Op::Nop), (1, Op::Leave(4)), (2, Op::Pop), (3, Op::Leave(4)), (4, Op::Return) ];
    let handlers = vec![ fx.clause(HandlerKind::Catch, (0, 2), (2, 4), Some(ty)) ];
    let body = fx.body(&[], code, handlers);
    Ok(fx.translate(&body)?.code.into_iter().map(|(_, i)| i).collect())
}

#[test]
fn test_generic_catch_by_role() -> GeneralResult<()> {
    use crate::types::GenericRole::*;
    use Instruction::*;
    let mut fx = Fixture::new();
    let helper = fx.config.generic_catch.clone();

    let open = fx.types.generic("T", Unresolved);
    let insns = catching(&mut fx, open)?;
    let name = fx.pool.string("T")?;
    let call = fx.pool.method_ref(&helper.class, &helper.name, &helper.descriptor, false)?;
    let at = insns.iter().position(|i| *i == jvm::ldc(name)).ok_or_else(|| Error::internal("no parameter name is loaded"))?;
    assert_eq!(insns[at - 1], Dup);
    assert_eq!(insns[at + 1], Invokestatic(call));
    assert!(matches!(insns[at + 2], Ifnull(_)));
    assert!(!insns.iter().any(|i| matches!(i, Instanceof(_))));

    // a bound parameter catches whatever the mapper hands over
    let bound = fx.types.generic("U", Resolved);
    let insns = catching(&mut fx, bound)?;
    assert!(!insns.contains(&Invokestatic(call)));
    assert!(!insns.iter().any(|i| matches!(i, Instanceof(_) | Ifnull(_))));
    assert_eq!(insns.iter().filter(|i| matches!(i, Invokestatic(_))).count(), 1);
    Ok(())
}

#[test]
fn test_fault_always_rethrows() -> GeneralResult<()> {
    use Instruction::*;
    let mut fx = Fixture::new();
    let code = vec![ (0, Op::Nop), (1, Op::Leave(4)), (2, Op::Nop), (3, Op::EndFinally), (4, Op::Return) ];
    let handlers = vec![ fx.clause(HandlerKind::Fault, (0, 2), (2, 4), None) ];
    let body = fx.body(&[], code, handlers);
    let m = fx.translate(&body)?;
    let insns : Vec<_> = m.code.iter().map(|(_, i)| i.clone()).collect();
    // no mapper call and no sentinel test, the leave goes straight to its target
    assert_eq!(insns, vec![ Goto(7), Goto(3), Athrow, Return ]);
    assert_eq!(m.exception_table.len(), 1);
    let entry = m.exception_table[0];
    assert_eq!((entry.start_pc, entry.end_pc, entry.handler_pc), (0, 3, 3));
    Ok(())
}
