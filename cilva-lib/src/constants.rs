use std::convert::TryFrom;

use rustc_hash::FxHashMap;

use crate::error::{Error, GeneralResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    /// IEEE bits, so that NaN payloads intern by identity
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    FieldRef { class : u16, name_and_type : u16 },
    MethodRef { class : u16, name_and_type : u16 },
    InterfaceMethodRef { class : u16, name_and_type : u16 },
    NameAndType { name : u16, descriptor : u16 },
}

impl Constant {
    /// number of pool indices the entry occupies
    fn size(&self) -> u16 {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

/// Saved pool length, for discarding the constants of a method that failed to translate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Checkpoint(usize);

/// Per-class constant pool builder. Entries are interned, so asking twice for the same
/// constant yields the same index.
#[derive(Clone, Debug, Default)]
pub struct ConstantPool {
    entries : Vec<(u16, Constant)>,
    index : FxHashMap<Constant, u16>,
}

impl ConstantPool {
    pub fn new() -> ConstantPool { Default::default() }

    /// index the next entry will receive
    fn next_index(&self) -> u16 {
        self.entries.last().map(|(i, c)| i + c.size()).unwrap_or(1)
    }

    fn add(&mut self, c : Constant) -> GeneralResult<u16> {
        if let Some(&i) = self.index.get(&c) {
            return Ok(i);
        }
        let i = self.next_index();
        let end = u32::from(i) + u32::from(c.size());
        if end > u32::from(u16::max_value()) {
            return Err(Error::internal("constant pool overflow"));
        }
        self.index.insert(c.clone(), i);
        self.entries.push((i, c));
        Ok(i)
    }

    pub fn utf8(&mut self, s : &str) -> GeneralResult<u16> { self.add(Constant::Utf8(s.to_owned())) }
    pub fn integer(&mut self, v : i32) -> GeneralResult<u16> { self.add(Constant::Integer(v)) }
    pub fn float(&mut self, v : f32) -> GeneralResult<u16> { self.add(Constant::Float(v.to_bits())) }
    pub fn long(&mut self, v : i64) -> GeneralResult<u16> { self.add(Constant::Long(v)) }
    pub fn double(&mut self, v : f64) -> GeneralResult<u16> { self.add(Constant::Double(v.to_bits())) }

    pub fn class(&mut self, name : &str) -> GeneralResult<u16> {
        let n = self.utf8(name)?;
        self.add(Constant::Class(n))
    }

    pub fn string(&mut self, s : &str) -> GeneralResult<u16> {
        let n = self.utf8(s)?;
        self.add(Constant::String(n))
    }

    fn name_and_type(&mut self, name : &str, descriptor : &str) -> GeneralResult<u16> {
        let name = self.utf8(name)?;
        let descriptor = self.utf8(descriptor)?;
        self.add(Constant::NameAndType { name, descriptor })
    }

    pub fn field_ref(&mut self, class : &str, name : &str, descriptor : &str) -> GeneralResult<u16> {
        let class = self.class(class)?;
        let name_and_type = self.name_and_type(name, descriptor)?;
        self.add(Constant::FieldRef { class, name_and_type })
    }

    pub fn method_ref(&mut self, class : &str, name : &str, descriptor : &str, interface : bool) -> GeneralResult<u16> {
        let class = self.class(class)?;
        let name_and_type = self.name_and_type(name, descriptor)?;
        if interface {
            self.add(Constant::InterfaceMethodRef { class, name_and_type })
        } else {
            self.add(Constant::MethodRef { class, name_and_type })
        }
    }

    pub fn get(&self, index : u16) -> Option<&Constant> {
        self.entries.binary_search_by_key(&index, |(i, _)| *i).ok().map(|n| &self.entries[n].1)
    }

    /// the `constant_pool_count` value of a class file holding this pool
    pub fn count(&self) -> u16 { self.next_index() }

    pub fn iter(&self) -> impl Iterator<Item=&(u16, Constant)> { self.entries.iter() }

    pub fn checkpoint(&self) -> Checkpoint { Checkpoint(self.entries.len()) }

    pub fn rollback(&mut self, cp : Checkpoint) {
        for (_, c) in self.entries.drain(cp.0..) {
            self.index.remove(&c);
        }
    }
}

/// Narrows an index for the one-byte `ldc` form.
pub fn short_index(index : u16) -> Option<u8> {
    u8::try_from(index).ok()
}

#[test]
fn test_interning() -> GeneralResult<()> {
    let mut pool = ConstantPool::new();
    let a = pool.class("java/lang/Object")?;
    let b = pool.class("java/lang/Object")?;
    assert_eq!(a, b);
    assert_eq!(pool.get(a), Some(&Constant::Class(1)));
    assert_eq!(pool.get(1), Some(&Constant::Utf8("java/lang/Object".to_owned())));
    Ok(())
}

#[test]
fn test_wide_entries() -> GeneralResult<()> {
    let mut pool = ConstantPool::new();
    let l = pool.long(1 << 40)?;
    let i = pool.integer(7)?;
    assert_eq!(l, 1);
    assert_eq!(i, 3);
    assert_eq!(pool.get(2), None);
    assert_eq!(pool.count(), 4);
    Ok(())
}

#[test]
fn test_rollback() -> GeneralResult<()> {
    let mut pool = ConstantPool::new();
    pool.string("kept")?;
    let cp = pool.checkpoint();
    pool.method_ref("demo/A", "run", "()V", false)?;
    pool.double(2.5)?;
    pool.rollback(cp);
    assert_eq!(pool.count(), 3);
    // interning forgot the discarded entries
    assert_eq!(pool.utf8("run")?, 3);
    Ok(())
}
