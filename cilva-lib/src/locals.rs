//! Maps source arguments and variables onto JVM local-variable slots.
//!
//! Slots are handed out in ascending order and advance by the category of the slot's type.
//! Arguments come first, then declared variables, then the synthetic variables the exception
//! reconstruction needs; everything above them is temporary space:
//! - get_temp(T)   -- borrow a slot for T, reusing the most recently parked slot of its category
//! - free_temp(S)  -- return S; the high-water mark rewinds when S is topmost, otherwise S parks

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, GeneralResult};
use crate::types::{TypeArena, TypeId};

#[cfg(test)]
use quickcheck::{quickcheck, TestResult};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SlotKind {
    Argument,
    Variable,
    Synthetic,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Declared {
    pub kind : SlotKind,
    pub name : Option<String>,
    pub ty : TypeId,
}

#[derive(Clone, Debug, Default)]
pub struct SlotAllocator {
    /// first slot above everything allocated
    next : u16,
    max : u16,
    arguments : Vec<u16>,
    variables : Vec<u16>,
    declared : BTreeMap<u16, Declared>,
    /// live temporaries with their categories
    temps : Vec<(u16, u8)>,
    /// freed out of order, most recent last
    parked : Vec<(u16, u8)>,
    /// declared slots given a default value in the prologue
    initialized : BTreeSet<u16>,
    written : BTreeSet<u16>,
}

impl SlotAllocator {
    pub fn new() -> SlotAllocator { Default::default() }

    fn extend(&mut self, category : u8) -> GeneralResult<u16> {
        let slot = self.next;
        self.next = slot.checked_add(category.into()).ok_or_else(|| Error::unsupported("too many local slots"))?;
        self.max = self.max.max(self.next);
        Ok(slot)
    }

    fn declare(&mut self, types : &TypeArena, kind : SlotKind, ty : TypeId, name : Option<String>) -> GeneralResult<u16> {
        if !self.temps.is_empty() || !self.parked.is_empty() {
            return Err(Error::internal("declared slot requested after temporaries"));
        }
        let slot = self.extend(types.category(ty))?;
        self.declared.insert(slot, Declared { kind, name, ty });
        Ok(slot)
    }

    pub fn allocate_argument(&mut self, types : &TypeArena, ty : TypeId, name : Option<String>) -> GeneralResult<u16> {
        let slot = self.declare(types, SlotKind::Argument, ty, name)?;
        self.arguments.push(slot);
        self.written.insert(slot);
        Ok(slot)
    }

    pub fn allocate_variable(&mut self, types : &TypeArena, ty : TypeId, name : Option<String>) -> GeneralResult<u16> {
        let slot = self.declare(types, SlotKind::Variable, ty, name)?;
        self.variables.push(slot);
        Ok(slot)
    }

    /// a slot owned by the translator for the whole method
    pub fn allocate_synthetic(&mut self, types : &TypeArena, ty : TypeId) -> GeneralResult<u16> {
        self.declare(types, SlotKind::Synthetic, ty, None)
    }

    pub fn argument_slot(&self, index : u16) -> GeneralResult<u16> {
        self.arguments.get(usize::from(index)).copied()
            .ok_or_else(|| Error::malformed(format!("no argument {}", index)))
    }

    pub fn variable_slot(&self, index : u16) -> GeneralResult<u16> {
        self.variables.get(usize::from(index)).copied()
            .ok_or_else(|| Error::malformed(format!("no local variable {}", index)))
    }

    pub fn declared(&self, slot : u16) -> Option<&Declared> {
        self.declared.get(&slot)
    }

    pub fn declared_type(&self, slot : u16) -> Option<TypeId> {
        self.declared.get(&slot).map(|d| d.ty)
    }

    pub fn is_variable(&self, slot : u16) -> bool {
        self.declared.get(&slot).map(|d| d.kind == SlotKind::Variable).unwrap_or(false)
    }

    pub fn get_temp(&mut self, types : &TypeArena, ty : TypeId) -> GeneralResult<u16> {
        let category = types.category(ty);
        let slot = match self.parked.iter().rposition(|&(_, c)| c == category) {
            Some(pos) => self.parked.remove(pos).0,
            None => self.extend(category)?,
        };
        self.temps.push((slot, category));
        Ok(slot)
    }

    pub fn free_temp(&mut self, slot : u16) -> GeneralResult<()> {
        let pos = self.temps.iter().position(|&(s, _)| s == slot)
            .ok_or_else(|| Error::internal(format!("slot {} is not a live temporary", slot)))?;
        let (_, category) = self.temps.remove(pos);
        let topmost = slot + u16::from(category) == self.next;
        if topmost && !self.parked.iter().any(|&(_, c)| c == category) {
            self.next = slot;
        } else {
            self.parked.push((slot, category));
        }
        Ok(())
    }

    pub fn max_locals(&self) -> u16 { self.max }

    /// Records the prologue default store for `slot`; true the first time only.
    pub fn mark_initialized(&mut self, slot : u16) -> bool {
        self.written.insert(slot);
        self.initialized.insert(slot)
    }

    pub fn mark_written(&mut self, slot : u16) {
        self.written.insert(slot);
    }

    /// Named arguments and variables that ever hold a value, in slot order.
    pub fn named_slots(&self) -> impl Iterator<Item=(u16, &str, TypeId)> {
        let written = &self.written;
        self.declared.iter()
            .filter(move |(slot, _)| written.contains(*slot))
            .filter_map(|(&slot, d)| d.name.as_ref().map(|n| (slot, n.as_str(), d.ty)))
    }
}

#[cfg(test)]
fn kinds() -> (TypeArena, TypeId, TypeId) {
    use crate::types::PrimitiveKind;
    let mut types = TypeArena::new(&crate::config::Config::default());
    let int = types.primitive(PrimitiveKind::Int32);
    let long = types.primitive(PrimitiveKind::Int64);
    (types, int, long)
}

#[test]
fn test_declared_slots() -> GeneralResult<()> {
    let (types, int, long) = kinds();
    let mut slots = SlotAllocator::new();
    assert_eq!(slots.allocate_argument(&types, long, Some("a".into()))?, 0);
    assert_eq!(slots.allocate_argument(&types, int, Some("b".into()))?, 2);
    assert_eq!(slots.allocate_variable(&types, long, Some("c".into()))?, 3);
    assert_eq!(slots.allocate_variable(&types, int, None)?, 5);
    assert_eq!(slots.variable_slot(1)?, 5);
    assert_eq!(slots.max_locals(), 6);
    assert!(slots.variable_slot(2).is_err());
    // c was never written, so only the arguments are listed
    let named : Vec<_> = slots.named_slots().map(|(s, n, _)| (s, n.to_owned())).collect();
    assert_eq!(named, vec![ (0, "a".to_owned()), (2, "b".to_owned()) ]);
    Ok(())
}

#[test]
fn test_out_of_order_free_parks() -> GeneralResult<()> {
    let (types, int, long) = kinds();
    let mut slots = SlotAllocator::new();
    let a = slots.get_temp(&types, int)?;
    let b = slots.get_temp(&types, int)?;
    slots.free_temp(a)?;
    let w = slots.get_temp(&types, long)?;
    assert_eq!(w, 2);
    assert_eq!(slots.get_temp(&types, int)?, a);
    slots.free_temp(w)?;
    slots.free_temp(b)?;
    assert_eq!(slots.max_locals(), 4);
    assert!(slots.free_temp(b).is_err());
    Ok(())
}

#[test]
fn test_no_declarations_after_temps() -> GeneralResult<()> {
    let (types, int, _) = kinds();
    let mut slots = SlotAllocator::new();
    slots.get_temp(&types, int)?;
    assert!(slots.allocate_variable(&types, int, None).is_err());
    Ok(())
}

#[cfg(test)]
quickcheck! {
    fn test_category_conservation(wide : Vec<bool>) -> TestResult {
        let (types, int, long) = kinds();
        let mut slots = SlotAllocator::new();
        let mut total = 0;
        for (i, &w) in wide.iter().enumerate() {
            let ty = if w { long } else { int };
            let r = if i % 2 == 0 {
                slots.allocate_argument(&types, ty, None)
            } else {
                slots.allocate_variable(&types, ty, None)
            };
            if r.is_err() { return TestResult::discard(); }
            total += if w { 2 } else { 1 };
        }
        TestResult::from_bool(u32::from(slots.max_locals()) == total)
    }

    fn test_free_then_get_returns_same_slot(ops : Vec<(bool, bool)>) -> TestResult {
        let (types, int, long) = kinds();
        let mut slots = SlotAllocator::new();
        let mut live : Vec<(u16, TypeId)> = Vec::new();
        for (get, wide) in ops {
            let ty = if wide { long } else { int };
            if get || live.is_empty() {
                match slots.get_temp(&types, ty) {
                    Ok(s) => live.push((s, ty)),
                    Err(_) => return TestResult::error("allocation failed"),
                }
            } else {
                // free an arbitrary live temp, then ask again for the same category
                let (slot, ty) = live.remove(usize::from(wide) % live.len());
                if slots.free_temp(slot).is_err() { return TestResult::error("free failed"); }
                match slots.get_temp(&types, ty) {
                    Ok(again) if again == slot => live.push((again, ty)),
                    _ => return TestResult::failed(),
                }
            }
        }
        TestResult::passed()
    }

    fn test_lifo_use_rewinds(depth : u8) -> TestResult {
        let (types, int, long) = kinds();
        let mut slots = SlotAllocator::new();
        let mut stack = Vec::new();
        for i in 0..(depth % 32) {
            let ty = if i % 3 == 0 { long } else { int };
            stack.push(slots.get_temp(&types, ty).ok());
        }
        let high = slots.max_locals();
        while let Some(Some(s)) = stack.pop() {
            if slots.free_temp(s).is_err() { return TestResult::failed(); }
        }
        let again = slots.get_temp(&types, int).ok();
        TestResult::from_bool(again == Some(0) && slots.max_locals() == high.max(1))
    }
}
