//! Abstract interpretation state: the live frame being translated against, and the frames
//! recorded at labels.
//!
//! A frame is recorded the first time a label is saved; later saves merge into it. Frames
//! marked for emission become the method's stack map. Frames of labels whose code has already
//! been translated can still be widened by a late save (a backward branch); `save_frame`
//! reports that so the caller can repair what it can.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryFrom;

use crate::code::Label;
use crate::constants::ConstantPool;
use crate::error::{Error, GeneralResult};
use crate::types::{AbstractType, StackKind, TypeArena, TypeId};

#[cfg(test)]
use quickcheck::{quickcheck, Arbitrary, Gen, TestResult};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub stack : Vec<TypeId>,
    /// absent slots are unset
    pub locals : BTreeMap<u16, TypeId>,
}

impl Frame {
    pub fn new(stack : Vec<TypeId>, locals : BTreeMap<u16, TypeId>) -> Frame {
        Frame { stack, locals }
    }

    /// operand stack depth in slots
    pub fn depth(&self, types : &TypeArena) -> u16 {
        self.stack.iter().map(|&t| u16::from(types.category(t))).sum()
    }
}

/// Merges two frames reaching the same point. The result does not depend on argument order.
pub fn merge(types : &mut TypeArena, a : &Frame, b : &Frame) -> GeneralResult<Frame> {
    if a.stack.len() != b.stack.len() {
        return Err(Error::malformed(format!(
            "stack depth {} does not match depth {}", a.stack.len(), b.stack.len())));
    }

    let mut stack = Vec::with_capacity(a.stack.len());
    for (&x, &y) in a.stack.iter().zip(&b.stack) {
        if types.category(x) != types.category(y) {
            return Err(Error::malformed(format!(
                "stack holds {} on one path and {} on another", types.describe(x), types.describe(y))));
        }
        stack.push(types.join(x, y));
    }

    let mut locals = BTreeMap::new();
    for (slot, &x) in &a.locals {
        if let Some(&y) = b.locals.get(slot) {
            let t = types.join(x, y);
            if !types.is_top(t) {
                locals.insert(*slot, t);
            }
        }
    }

    Ok(Frame { stack, locals })
}

#[derive(Clone, Debug, PartialEq)]
pub enum Saved {
    /// first frame for the label
    Recorded,
    Merged,
    Unchanged,
    /// the label's code was already translated against a narrower frame
    Invalidated { locals : Vec<u16>, stack : bool },
}

#[derive(Clone, Debug)]
struct Recorded {
    frame : Frame,
    emit : bool,
}

#[derive(Clone, Debug)]
struct Backfill {
    label : Label,
    snapshot : Option<Frame>,
    destination : Option<Label>,
}

#[derive(Clone, Debug, Default)]
pub struct FrameStore {
    live : Frame,
    recorded : BTreeMap<Label, Recorded>,
    bound : BTreeSet<Label>,
    pending : Vec<Backfill>,
    max_stack : u16,
}

impl FrameStore {
    pub fn new(initial : Frame) -> FrameStore {
        FrameStore { live : initial, ..Default::default() }
    }

    pub fn live(&self) -> &Frame { &self.live }

    pub fn max_stack(&self) -> u16 { self.max_stack }

    pub fn push(&mut self, types : &TypeArena, ty : TypeId) -> GeneralResult<()> {
        if types.is_top(ty) {
            return Err(Error::internal("pushing an unset value"));
        }
        self.live.stack.push(ty);
        self.note_depth(types, 0);
        Ok(())
    }

    pub fn pop(&mut self) -> GeneralResult<TypeId> {
        self.live.stack.pop().ok_or_else(|| Error::malformed("stack underflow"))
    }

    pub fn peek(&self) -> GeneralResult<TypeId> {
        self.live.stack.last().copied().ok_or_else(|| Error::malformed("stack underflow"))
    }

    pub fn is_stack_empty(&self) -> bool { self.live.stack.is_empty() }

    /// Accounts for `extra` slots pushed above the live stack by an instruction sequence the
    /// frame does not model item by item.
    pub fn note_depth(&mut self, types : &TypeArena, extra : u16) {
        self.max_stack = self.max_stack.max(self.live.depth(types) + extra);
    }

    pub fn local(&self, slot : u16) -> Option<TypeId> {
        self.live.locals.get(&slot).copied()
    }

    pub fn set_local(&mut self, types : &TypeArena, slot : u16, ty : TypeId) {
        set_slot(types, &mut self.live.locals, slot, ty);
    }

    pub fn clear_local(&mut self, slot : u16) {
        self.live.locals.remove(&slot);
    }

    /// Rewrites every occurrence of `from` in the live frame.
    pub fn replace_type(&mut self, from : TypeId, to : TypeId) {
        let swap = |t : &mut TypeId| if *t == from { *t = to };
        self.live.stack.iter_mut().for_each(swap);
        self.live.locals.values_mut().for_each(swap);
    }

    pub fn has(&self, label : Label) -> bool { self.recorded.contains_key(&label) }

    pub fn recorded(&self, label : Label) -> Option<&Frame> {
        self.recorded.get(&label).map(|r| &r.frame)
    }

    pub fn save_frame(&mut self, types : &mut TypeArena, label : Label, is_branch_target : bool, overwrite : bool)
        -> GeneralResult<Saved>
    {
        let frame = self.live.clone();
        self.save_frame_with(types, label, frame, is_branch_target, overwrite)
    }

    pub fn save_frame_with(&mut self, types : &mut TypeArena, label : Label, frame : Frame, emit : bool, overwrite : bool)
        -> GeneralResult<Saved>
    {
        // a deferred snapshot is the state the label's code was translated against
        if !self.recorded.contains_key(&label) {
            if let Some(pos) = self.pending.iter().position(|b| b.label == label) {
                if let Some(snapshot) = self.pending.remove(pos).snapshot {
                    self.recorded.insert(label, Recorded { frame : snapshot, emit : true });
                }
            }
        }

        let bound = self.bound.contains(&label);
        let rec = match self.recorded.get_mut(&label) {
            Some(rec) => rec,
            None => {
                self.recorded.insert(label, Recorded { frame, emit });
                return Ok(Saved::Recorded);
            },
        };
        rec.emit |= emit;

        let updated = if overwrite {
            frame
        } else {
            merge(types, &rec.frame, &frame).map_err(|e| match e {
                Error::Malformed(m) => Error::Malformed(format!("{} at {}", m, label)),
                other => other,
            })?
        };

        if updated == rec.frame {
            return Ok(Saved::Unchanged);
        }
        let locals = rec.frame.locals.iter()
            .filter(|(s, t)| updated.locals.get(s) != Some(t))
            .map(|(s, _)| *s)
            .collect();
        let stack = updated.stack != rec.frame.stack;
        rec.frame = updated;

        Ok(if bound { Saved::Invalidated { locals, stack } } else { Saved::Merged })
    }

    pub fn load_frame(&mut self, label : Label) -> GeneralResult<()> {
        let rec = self.recorded.get(&label)
            .ok_or_else(|| Error::internal(format!("no frame recorded for {}", label)))?;
        self.live = rec.frame.clone();
        Ok(())
    }

    pub fn mark_bound(&mut self, label : Label) {
        self.bound.insert(label);
    }

    /// Remembers that `label` follows an unconditional transfer and has no frame yet.
    pub fn defer_backfill(&mut self, label : Label, snapshot : Frame, destination : Option<Label>) {
        self.pending.push(Backfill { label, snapshot : Some(snapshot), destination });
    }

    /// Gives every deferred label that still lacks a frame the state its code was translated
    /// against, or failing that the frame of the transfer's destination.
    pub fn backfill_unconditional_branches(&mut self) -> GeneralResult<usize> {
        let mut count = 0;
        for b in std::mem::replace(&mut self.pending, Vec::new()) {
            if self.recorded.contains_key(&b.label) {
                continue;
            }
            let frame = match (b.snapshot, b.destination.and_then(|d| self.recorded(d))) {
                (Some(s), _) => s,
                (None, Some(f)) => f.clone(),
                (None, None) =>
                    return Err(Error::internal(format!("no frame available for unreachable {}", b.label))),
            };
            log::trace!("backfilled frame at {}", b.label);
            self.recorded.insert(b.label, Recorded { frame, emit : true });
            count += 1;
        }
        Ok(count)
    }

    /// Gives `slot` the type `ty` wherever it is unset: in the live frame, every recorded frame
    /// and every deferred snapshot. Used once the prologue stores a default into the slot.
    pub fn materialize(&mut self, types : &TypeArena, slot : u16, ty : TypeId) {
        let fill = |locals : &mut BTreeMap<u16, TypeId>| {
            let shadowed = slot > 0 && locals.get(&(slot - 1)).map(|&t| types.category(t) == 2).unwrap_or(false);
            if !shadowed && !locals.contains_key(&slot) {
                set_slot(types, locals, slot, ty);
            }
        };
        fill(&mut self.live.locals);
        for rec in self.recorded.values_mut() {
            fill(&mut rec.frame.locals);
        }
        for b in &mut self.pending {
            if let Some(s) = &mut b.snapshot {
                fill(&mut s.locals);
            }
        }
    }

    /// Frames to emit, keyed by byte offset. Labels landing on the same offset are merged.
    pub fn resolve(&self, types : &mut TypeArena, labels : &BTreeMap<Label, usize>) -> GeneralResult<BTreeMap<usize, Frame>> {
        let mut out : BTreeMap<usize, Frame> = BTreeMap::new();
        for (label, rec) in self.recorded.iter().filter(|(_, r)| r.emit) {
            let addr = *labels.get(label)
                .ok_or_else(|| Error::internal(format!("frame recorded for unbound label {}", label)))?;
            let frame = match out.remove(&addr) {
                Some(prev) => merge(types, &prev, &rec.frame)?,
                None => rec.frame.clone(),
            };
            out.insert(addr, frame);
        }
        Ok(out)
    }
}

fn set_slot(types : &TypeArena, locals : &mut BTreeMap<u16, TypeId>, slot : u16, ty : TypeId) {
    if slot > 0 {
        if let Some(&prev) = locals.get(&(slot - 1)) {
            if types.category(prev) == 2 {
                locals.remove(&(slot - 1));
            }
        }
    }
    if types.category(ty) == 2 {
        locals.remove(&(slot + 1));
    }
    locals.insert(slot, ty);
}

#[derive(Clone, Debug, PartialEq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// constant pool index of a class
    Object(u16),
}

/// One full stack map frame.
#[derive(Clone, Debug, PartialEq)]
pub struct StackMapEntry {
    pub offset : u16,
    pub locals : Vec<VerificationType>,
    pub stack : Vec<VerificationType>,
}

pub fn verification_type(types : &TypeArena, pool : &mut ConstantPool, ty : TypeId) -> GeneralResult<VerificationType> {
    Ok(match types.get(ty) {
        AbstractType::Top => VerificationType::Top,
        AbstractType::Null => VerificationType::Null,
        AbstractType::UninitializedThis => VerificationType::UninitializedThis,
        _ => match types.stack_kind(ty)? {
            StackKind::Int => VerificationType::Integer,
            StackKind::Long => VerificationType::Long,
            StackKind::Float => VerificationType::Float,
            StackKind::Double => VerificationType::Double,
            StackKind::Reference => VerificationType::Object(pool.class(&types.class_name(ty)?)?),
        },
    })
}

pub fn stack_map_entry(types : &TypeArena, pool : &mut ConstantPool, offset : usize, frame : &Frame)
    -> GeneralResult<StackMapEntry>
{
    let offset = u16::try_from(offset).map_err(|_| Error::internal("frame offset out of range"))?;

    let mut locals = Vec::new();
    let end = frame.locals.keys().next_back().map(|&s| u32::from(s) + 1).unwrap_or(0);
    let mut slot = 0_u32;
    while slot < end {
        // `end` never exceeds u16::MAX + 1, so every visited slot fits
        match frame.locals.get(&(slot as u16)) {
            Some(&t) => {
                locals.push(verification_type(types, pool, t)?);
                slot += u32::from(types.category(t));
            },
            None => {
                locals.push(VerificationType::Top);
                slot += 1;
            },
        }
    }

    let stack = frame.stack.iter()
        .map(|&t| verification_type(types, pool, t))
        .collect::<GeneralResult<_>>()?;

    Ok(StackMapEntry { offset, locals, stack })
}

#[cfg(test)]
fn sample_types() -> (TypeArena, Vec<TypeId>) {
    use crate::types::PrimitiveKind::*;
    let mut types = TypeArena::new(&crate::config::Config::default());
    let shape = types.declare_interface("demo/IShape", &[]);
    let circle = types.declare_class("demo/Circle", None, &[shape]);
    let square = types.declare_class("demo/Square", None, &[shape]);
    let string = types.reference("java/lang/String");
    let null = types.null();
    let point = types.declare_value("demo/Point", &[]);
    let palette = vec![
        types.primitive(Int32), types.primitive(Boolean), types.primitive(Float32),
        circle, square, shape, string, null, point, types.object(),
    ];
    (types, palette)
}

#[cfg(test)]
#[derive(Clone, Debug)]
struct Shape {
    stack : Vec<u8>,
    locals : Vec<(u8, u8)>,
}

#[cfg(test)]
impl Arbitrary for Shape {
    fn arbitrary<G : Gen>(g : &mut G) -> Self {
        let depth = g.next_u32() % 4;
        let count = g.next_u32() % 6;
        Shape {
            stack : (0..depth).map(|_| (g.next_u32() % 16) as u8).collect(),
            locals : (0..count).map(|_| ((g.next_u32() % 8) as u8, (g.next_u32() % 16) as u8)).collect(),
        }
    }
}

#[cfg(test)]
fn build(palette : &[TypeId], shape : &Shape) -> Frame {
    let pick = |n : u8| palette[usize::from(n) % palette.len()];
    Frame {
        stack : shape.stack.iter().map(|&n| pick(n)).collect(),
        locals : shape.locals.iter().map(|&(s, n)| (u16::from(s), pick(n))).collect(),
    }
}

#[cfg(test)]
quickcheck! {
    fn test_merge_commutes(a : Shape, b : Shape) -> TestResult {
        let (mut types, palette) = sample_types();
        let (fa, fb) = (build(&palette, &a), build(&palette, &b));
        match (merge(&mut types, &fa, &fb), merge(&mut types, &fb, &fa)) {
            (Ok(x), Ok(y)) => TestResult::from_bool(x == y),
            (Err(_), Err(_)) => TestResult::passed(),
            _ => TestResult::failed(),
        }
    }

    fn test_merge_is_idempotent(a : Shape) -> TestResult {
        let (mut types, palette) = sample_types();
        let fa = build(&palette, &a);
        match merge(&mut types, &fa, &fa) {
            Ok(x) => TestResult::from_bool(x == fa),
            Err(_) => TestResult::failed(),
        }
    }
}

#[test]
fn test_merge_depth_mismatch() {
    let (mut types, palette) = sample_types();
    let a = Frame::new(vec![ palette[0] ], BTreeMap::new());
    let b = Frame::new(vec![], BTreeMap::new());
    assert!(merge(&mut types, &a, &b).is_err());
}

#[test]
fn test_merge_rules() -> GeneralResult<()> {
    let (mut types, p) = sample_types();
    let (int, boolean, float, circle, square, shape, point) = (p[0], p[1], p[2], p[3], p[4], p[5], p[8]);
    let a = Frame::new(vec![ circle, boolean ], vec![ (0, int), (1, circle), (2, point), (3, int) ].into_iter().collect());
    let b = Frame::new(vec![ square, int ], vec![ (0, float), (1, square), (2, point) ].into_iter().collect());
    let m = merge(&mut types, &a, &b)?;
    assert_eq!(m.stack, vec![ shape, int ]);
    assert_eq!(m.locals, vec![ (1, shape), (2, point) ].into_iter().collect());
    Ok(())
}

#[test]
fn test_first_save_wins_then_merges() -> GeneralResult<()> {
    let (mut types, p) = sample_types();
    let (int, circle, square, shape) = (p[0], p[3], p[4], p[5]);
    let mut store = FrameStore::new(Frame::default());
    store.push(&types, circle)?;
    let l = Label::Source(10);
    assert_eq!(store.save_frame(&mut types, l, true, false)?, Saved::Recorded);
    store.pop()?;
    store.push(&types, square)?;
    store.set_local(&types, 0, int);
    assert_eq!(store.save_frame(&mut types, l, true, false)?, Saved::Merged);
    assert_eq!(store.recorded(l).map(|f| f.stack.clone()), Some(vec![ shape ]));
    store.mark_bound(l);
    store.push(&types, int)?;
    assert!(store.save_frame(&mut types, l, true, false).is_err());
    store.pop()?;
    store.pop()?;
    store.push(&types, int)?;
    // same depth, incompatible category 1 types: recorded as an unusable slot, after the fact
    assert_eq!(store.save_frame(&mut types, l, true, false)?, Saved::Invalidated { locals : vec![], stack : true });
    assert_eq!(store.save_frame(&mut types, l, true, true)?, Saved::Invalidated { locals : vec![], stack : true });
    assert_eq!(store.recorded(l).map(|f| f.stack.clone()), Some(vec![ int ]));
    Ok(())
}

#[test]
fn test_backfill_prefers_snapshot() -> GeneralResult<()> {
    let (mut types, p) = sample_types();
    let (int, circle) = (p[0], p[3]);
    let mut store = FrameStore::new(Frame::default());
    store.push(&types, circle)?;
    store.save_frame(&mut types, Label::Source(20), true, false)?;
    store.pop()?;
    store.set_local(&types, 3, int);
    let snapshot = store.live().clone();
    store.defer_backfill(Label::Source(5), snapshot, Some(Label::Source(20)));
    assert_eq!(store.backfill_unconditional_branches()?, 1);
    let f = store.recorded(Label::Source(5)).cloned().unwrap_or_default();
    assert!(f.stack.is_empty());
    assert_eq!(f.locals.get(&3), Some(&int));
    Ok(())
}

#[test]
fn test_materialize_fills_unset_slots() -> GeneralResult<()> {
    let (mut types, p) = sample_types();
    let (int, circle) = (p[0], p[3]);
    let long = types.primitive(crate::types::PrimitiveKind::Int64);
    let mut store = FrameStore::new(Frame::default());
    store.save_frame(&mut types, Label::Source(1), true, false)?;
    store.set_local(&types, 1, circle);
    store.save_frame(&mut types, Label::Source(2), true, false)?;
    store.set_local(&types, 0, long);
    store.save_frame(&mut types, Label::Source(3), true, false)?;
    store.materialize(&types, 1, int);
    assert_eq!(store.recorded(Label::Source(1)).and_then(|f| f.locals.get(&1).copied()), Some(int));
    assert_eq!(store.recorded(Label::Source(2)).and_then(|f| f.locals.get(&1).copied()), Some(circle));
    // slot 1 is the upper half of the long in slot 0
    assert_eq!(store.recorded(Label::Source(3)).and_then(|f| f.locals.get(&1).copied()), None);
    Ok(())
}

#[test]
fn test_stack_map_entry_layout() -> GeneralResult<()> {
    use VerificationType::*;
    let (mut types, p) = sample_types();
    let (int, circle) = (p[0], p[3]);
    let long = types.primitive(crate::types::PrimitiveKind::Int64);
    let mut pool = ConstantPool::new();
    let frame = Frame::new(vec![ long ], vec![ (0, circle), (1, long), (4, int) ].into_iter().collect());
    let entry = stack_map_entry(&types, &mut pool, 7, &frame)?;
    let c = pool.class("demo/Circle")?;
    assert_eq!(entry.locals, vec![ Object(c), Long, Top, Integer ]);
    assert_eq!(entry.stack, vec![ Long ]);
    Ok(())
}
