#![deny(clippy::items_after_statements)]
#![deny(clippy::needless_borrow)]
#![deny(clippy::option_unwrap_used)]
#![deny(clippy::redundant_field_names)]
#![deny(clippy::result_unwrap_used)]
#![deny(unconditional_recursion)]

mod branch;
pub mod cil;
pub mod code;
pub mod config;
pub mod constants;
pub mod error;
pub mod frames;
mod jvm;
mod locals;
pub mod regions;
mod translate;
pub mod types;

use std::collections::BTreeMap;
use std::fmt;

use classfile_parser::code_attribute::Instruction;

use cil::{MethodBody, Offset};
use config::Config;
use constants::ConstantPool;
use error::GeneralResult;
use frames::StackMapEntry;
use translate::Translator;
use types::TypeArena;

/// One row of a method's exception table. Every region catches the same throwable class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc : u16,
    pub end_pc : u16,
    pub handler_pc : u16,
    pub catch_type : u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalVariable {
    pub name : String,
    pub slot : u16,
    pub descriptor : String,
}

/// A translated method body, ready for a class-file writer.
#[derive(Clone, Debug, PartialEq)]
pub struct Method {
    pub name : String,
    /// instructions with their byte addresses, branch offsets resolved
    pub code : Vec<(usize, Instruction)>,
    /// innermost regions first
    pub exception_table : Vec<ExceptionTableEntry>,
    pub stack_map : Vec<StackMapEntry>,
    pub max_stack : u16,
    pub max_locals : u16,
    pub local_variables : Vec<LocalVariable>,
    /// byte address of the code for each source offset
    pub source_offsets : BTreeMap<Offset, usize>,
}

impl fmt::Display for Method {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{} (stack {}, locals {}):", self.name, self.max_stack, self.max_locals)?;
        let framed : BTreeMap<_, _> = self.stack_map.iter().map(|e| (usize::from(e.offset), e)).collect();
        for (addr, insn) in &self.code {
            if let Some(e) = framed.get(addr) {
                writeln!(f, "      frame {:?} / {:?}", e.locals, e.stack)?;
            }
            writeln!(f, "{:6}: {:?}", addr, insn)?;
        }
        for e in &self.exception_table {
            writeln!(f, "  [{}, {}) -> {} catching #{}", e.start_pc, e.end_pc, e.handler_pc, e.catch_type)?;
        }
        Ok(())
    }
}

fn jvm_method_name(body : &MethodBody) -> &str {
    match body.name.as_str() {
        ".ctor"  => "<init>",
        ".cctor" => "<clinit>",
        other    => other,
    }
}

/// Translates one method body. On failure nothing the translation added to `pool` survives,
/// and the error names the method.
pub fn translate_method(body : &MethodBody, types : &mut TypeArena, pool : &mut ConstantPool, config : &Config)
    -> GeneralResult<Method>
{
    let qualified = format!("{}::{}", types.describe(body.owner), body.name);
    log::debug!("translating {} ({} instructions, {} handlers)", qualified, body.code.len(), body.handlers.len());

    let checkpoint = pool.checkpoint();
    let result = Translator::new(body, types, pool, config)
        .and_then(|t| t.run(jvm_method_name(body).to_owned()));

    match result {
        Ok(method) => {
            log::debug!("translated {}: {} instructions, {} frames, {} exception entries",
                qualified, method.code.len(), method.stack_map.len(), method.exception_table.len());
            Ok(method)
        },
        Err(e) => {
            pool.rollback(checkpoint);
            Err(e.in_method(qualified))
        },
    }
}

/// Translates each body in turn; a failure affects only its own method.
pub fn translate_methods(bodies : &[MethodBody], types : &mut TypeArena, pool : &mut ConstantPool, config : &Config)
    -> Vec<GeneralResult<Method>>
{
    bodies.iter().map(|b| translate_method(b, types, pool, config)).collect()
}

#[cfg(test)]
use crate::cil::{ExceptionHandler, HandlerKind, Op, Variable};
#[cfg(test)]
use crate::code::Label;
#[cfg(test)]
use crate::error::ErrorKind;
#[cfg(test)]
use crate::frames::VerificationType;
#[cfg(test)]
use crate::translate::fixture::Fixture;
#[cfg(test)]
use crate::types::TypeId;
#[cfg(test)]
use quickcheck::{quickcheck, TestResult};

#[cfg(test)]
fn exception(fx : &mut Fixture, name : &str) -> TypeId {
    let root = fx.types.exception_root();
    fx.types.declare_class(name, root, &[])
}

#[cfg(test)]
fn at(method : &Method, addr : usize) -> Option<&Instruction> {
    method.code.iter().find(|(a, _)| *a == addr).map(|(_, i)| i)
}

#[cfg(test)]
fn goto_destination(method : &Method, addr : usize) -> Option<usize> {
    match at(method, addr)? {
        Instruction::Goto(o) => Some((addr as i64 + i64::from(*o)) as usize),
        _ => None,
    }
}

#[test]
fn test_try_catch_catch_finally() -> GeneralResult<()> {
    use Instruction::*;
    use HandlerKind::*;

    let mut fx = Fixture::new();
    let int = fx.int();
    let a = exception(&mut fx, "demo/A");
    let b = exception(&mut fx, "demo/B");
    let code = vec![
        (0, Op::LoadInt32(1)),
        (1, Op::StoreLocal(0)),
        (2, Op::Leave(10)),
        (3, Op::Pop),
        (4, Op::Leave(10)),
        (5, Op::Pop),
        (6, Op::Leave(10)),
        (7, Op::LoadInt32(2)),
        (8, Op::StoreLocal(0)),
        (9, Op::EndFinally),
        (10, Op::Return),
    ];
    let handlers = vec![
        fx.clause(Finally, (0, 3), (7, 10), None),
        fx.clause(Catch, (0, 3), (5, 7), Some(b)),
        fx.clause(Catch, (0, 3), (3, 5), Some(a)),
    ];
    let body = fx.body(&[ int ], code, handlers);
    let m = translate_method(&body, &mut fx.types, &mut fx.pool, &fx.config)?;

    assert_eq!(m.exception_table.len(), 1);
    let entry = m.exception_table[0];
    assert_eq!(entry.start_pc, 0);
    assert_eq!(entry.end_pc, entry.handler_pc);
    let handler = usize::from(entry.handler_pc);
    assert!(m.stack_map.iter().any(|e| usize::from(e.offset) == handler));

    let mapper = fx.config.exception_mapper.clone();
    let mapper = fx.pool.method_ref(&mapper.class, &mapper.name, &mapper.descriptor, false)?;
    let (ia, ib) = (fx.pool.class("demo/A")?, fx.pool.class("demo/B")?);
    let sentinel = &fx.config.leave_sentinel;
    let create = fx.pool.method_ref(&sentinel.class, &sentinel.factory, &fx.config.sentinel_factory_descriptor(), false)?;

    // the normal exit from the protected range builds a sentinel
    assert!(m.code.iter().take_while(|(a, _)| *a < handler).any(|(_, i)| i == &Invokestatic(create)));

    let dispatch : Vec<_> = m.code.iter()
        .skip_while(|(a, _)| *a < handler)
        .map(|(_, i)| i.clone())
        .filter(|i| match i { Invokestatic(_) | Instanceof(_) => true, _ => false })
        .take(3)
        .collect();
    assert_eq!(dispatch, vec![ Invokestatic(mapper), Instanceof(ia), Instanceof(ib) ]);

    // the last clause test falls into the finally code
    let finally = m.source_offsets[&7];
    assert!(m.code.iter().any(|(a, _)| goto_destination(&m, *a) == Some(finally)));
    Ok(())
}

#[test]
fn test_unset_local_is_materialized_at_merge() -> GeneralResult<()> {
    use Instruction::*;

    let mut fx = Fixture::new();
    let int = fx.int();
    let mut body = fx.body(&[ int ], vec![
        (0, Op::LoadArg(0)),
        (1, Op::BranchIf { truth : true, target : 4 }),
        (2, Op::LoadInt32(0)),
        (3, Op::StoreLocal(0)),
        (4, Op::LoadLocal(0)),
        (5, Op::Pop),
        (6, Op::Return),
    ], vec![]);
    body.params = vec![ Variable { name : Some("flag".to_owned()), ty : int } ];
    let m = translate_method(&body, &mut fx.types, &mut fx.pool, &fx.config)?;

    assert_eq!(m.code[0], (0, Iconst0));
    assert_eq!(m.code[1], (1, Istore1));
    let merge = m.source_offsets[&4];
    let entry = m.stack_map.iter().find(|e| usize::from(e.offset) == merge);
    assert_eq!(entry.map(|e| e.locals.clone()), Some(vec![ VerificationType::Integer, VerificationType::Integer ]));
    assert_eq!(m.local_variables, vec![ LocalVariable { name : "flag".to_owned(), slot : 0, descriptor : "I".to_owned() } ]);
    Ok(())
}

#[test]
fn test_dead_code_gets_a_frame() -> GeneralResult<()> {
    let mut fx = Fixture::new();
    let body = fx.body(&[], vec![
        (0, Op::Jump(3)),
        (1, Op::LoadInt32(5)),
        (2, Op::Pop),
        (3, Op::Return),
    ], vec![]);
    let m = translate_method(&body, &mut fx.types, &mut fx.pool, &fx.config)?;
    assert_eq!(m.code[0], (0, Instruction::Goto(5)));
    let framed : Vec<_> = m.stack_map.iter().map(|e| e.offset).collect();
    assert_eq!(framed, vec![ 3, 5 ]);
    Ok(())
}

#[test]
fn test_filter_reenters_dispatch() -> GeneralResult<()> {
    use Instruction::*;

    let mut fx = Fixture::new();
    let handler = ExceptionHandler {
        try_start : 0,
        try_end : 2,
        kind : HandlerKind::Filter,
        handler_start : 5,
        handler_end : 7,
        filter_start : Some(2),
        catch_type : None,
    };
    let body = fx.body(&[], vec![
        (0, Op::Nop),
        (1, Op::Leave(7)),
        (2, Op::Pop),
        (3, Op::LoadInt32(1)),
        (4, Op::EndFilter),
        (5, Op::Pop),
        (6, Op::Leave(7)),
        (7, Op::Return),
    ], vec![ handler ]);
    let m = translate_method(&body, &mut fx.types, &mut fx.pool, &fx.config)?;

    // the filter slot is the only local: parked once, reloaded on accept and on reject
    assert_eq!(m.max_locals, 1);
    assert_eq!(m.code.iter().filter(|(_, i)| i == &Astore0).count(), 1);
    assert_eq!(m.code.iter().filter(|(_, i)| i == &Aload0).count(), 2);
    assert!(m.code.iter().any(|(_, i)| match i { Ifeq(_) => true, _ => false }));
    assert!(m.stack_map.iter().any(|e| usize::from(e.offset) == m.source_offsets[&5]));
    Ok(())
}

#[test]
fn test_rethrow_reloads_caught_exception() -> GeneralResult<()> {
    use Instruction::*;

    let mut fx = Fixture::new();
    let failure = exception(&mut fx, "demo/Failure");
    let handlers = vec![ fx.clause(HandlerKind::Catch, (0, 2), (2, 4), Some(failure)) ];
    let body = fx.body(&[], vec![
        (0, Op::Nop),
        (1, Op::Leave(4)),
        (2, Op::Pop),
        (3, Op::Rethrow),
        (4, Op::Return),
    ], handlers);
    let m = translate_method(&body, &mut fx.types, &mut fx.pool, &fx.config)?;
    let insns : Vec<_> = m.code.iter().map(|(_, i)| i.clone()).collect();
    assert!(insns.windows(2).any(|w| w == [ Dup, Astore0 ]));
    assert!(insns.windows(3).any(|w| w == [ Pop, Aload0, Athrow ]));
    Ok(())
}

#[test]
fn test_nested_region_in_finally_parks_exception() -> GeneralResult<()> {
    use HandlerKind::*;
    use Instruction::*;

    let mut fx = Fixture::new();
    let object = fx.types.object();
    let handlers = vec![
        fx.clause(Finally, (0, 2), (2, 8), None),
        fx.clause(Catch, (2, 4), (4, 6), Some(object)),
    ];
    let body = fx.body(&[], vec![
        (0, Op::Nop),
        (1, Op::Leave(8)),
        (2, Op::Nop),
        (3, Op::Leave(6)),
        (4, Op::Pop),
        (5, Op::Leave(6)),
        (6, Op::Nop),
        (7, Op::EndFinally),
        (8, Op::Return),
    ], handlers);
    let m = translate_method(&body, &mut fx.types, &mut fx.pool, &fx.config)?;

    assert_eq!(m.exception_table.len(), 2);
    let (inner, outer) = (m.exception_table[0], m.exception_table[1]);
    assert_eq!(outer.start_pc, 0);
    assert!(inner.start_pc >= outer.handler_pc);
    assert!(m.code.iter().any(|(_, i)| i == &Astore0));
    assert!(m.code.iter().any(|(_, i)| i == &Aload0));
    Ok(())
}

#[test]
fn test_failure_rolls_back_pool() -> GeneralResult<()> {
    let mut fx = Fixture::new();
    let int = fx.int();
    fx.pool.string("kept")?;
    let before = fx.pool.count();
    let body = fx.body(&[ int ], vec![
        (0, Op::LoadString("discarded".to_owned())),
        (1, Op::Pop),
        (2, Op::AddressOf(0)),
        (3, Op::Return),
    ], vec![]);
    let e = translate_method(&body, &mut fx.types, &mut fx.pool, &fx.config).map(|_| ()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Unsupported);
    assert!(e.to_string().starts_with("in method demo/Sample::run"));
    assert_eq!(fx.pool.count(), before);
    Ok(())
}

#[test]
fn test_failures_are_per_method() -> GeneralResult<()> {
    let mut fx = Fixture::new();
    let good = fx.body(&[], vec![ (0, Op::Return) ], vec![]);
    let bad = fx.body(&[], vec![ (0, Op::Pop), (1, Op::Return) ], vec![]);
    let results = translate_methods(&[ bad, good ], &mut fx.types, &mut fx.pool, &fx.config);
    assert_eq!(results[0].as_ref().map(|_| ()).map_err(|e| e.kind()), Err(ErrorKind::Malformed));
    assert!(results[1].is_ok());
    Ok(())
}

/// Destinations of the resumption table of a finally clause, resolved through its gotos.
#[cfg(test)]
fn resume_destinations(m : &Method) -> Option<Vec<usize>> {
    let (addr, offsets) = m.code.iter().rev().find_map(|(a, i)| match i {
        Instruction::Tableswitch { offsets, .. } => Some((*a, offsets.clone())),
        _ => None,
    })?;
    offsets.iter().map(|&o| goto_destination(m, (addr as i64 + i64::from(o)) as usize)).collect()
}

#[cfg(test)]
quickcheck! {
    fn test_sentinel_round_trip(n : u8) -> TestResult {
        use HandlerKind::*;

        let n = 1 + usize::from(n % 6);
        let mut fx = Fixture::new();
        let int = fx.int();

        // a switch picks one of n leaves out of a try/finally
        let fin = 2 + n;
        let mut code = vec![
            (0, Op::LoadArg(0)),
            (1, Op::Switch((3..2 + n).collect())),
        ];
        code.extend((0..n).map(|i| (2 + i, Op::Leave(fin + 2 + i))));
        code.push((fin, Op::Nop));
        code.push((fin + 1, Op::EndFinally));
        code.extend((0..n).map(|i| (fin + 2 + i, Op::Return)));

        let handlers = vec![ fx.clause(Finally, (0, fin), (fin, fin + 2), None) ];
        let mut body = fx.body(&[], code, handlers);
        body.params = vec![ Variable { name : None, ty : int } ];

        let m = match translate_method(&body, &mut fx.types, &mut fx.pool, &fx.config) {
            Ok(m) => m,
            Err(e) => return TestResult::error(e.to_string()),
        };
        // the leave to destination i pushes i just before creating its sentinel
        let sentinel = fx.config.leave_sentinel.clone();
        let descriptor = fx.config.sentinel_factory_descriptor();
        let create = match fx.pool.method_ref(&sentinel.class, &sentinel.factory, &descriptor, false) {
            Ok(index) => Instruction::Invokestatic(index),
            Err(e) => return TestResult::error(e.to_string()),
        };
        let pushed : Vec<_> = m.code.windows(2).filter(|w| w[1].1 == create).map(|w| w[0].1.clone()).collect();
        let indices : GeneralResult<Vec<_>> = (0..n).map(|i| jvm::int_constant(&mut fx.pool, i as i32)).collect();
        if indices.ok() != Some(pushed) {
            return TestResult::failed();
        }

        let expected : Vec<_> = (0..n).map(|i| m.source_offsets[&(fin + 2 + i)]).collect();
        if n == 1 {
            // a single destination needs no table
            let resume = m.code.iter().rev().find_map(|(a, _)| goto_destination(&m, *a));
            TestResult::from_bool(resume == Some(expected[0]))
        } else {
            TestResult::from_bool(resume_destinations(&m) == Some(expected))
        }
    }

    fn test_clause_order_is_preserved(keys : Vec<u8>) -> TestResult {
        let n = 1 + keys.len() % 4;
        let mut fx = Fixture::new();
        let types : Vec<_> = (0..n).map(|j| exception(&mut fx, &format!("demo/E{}", j))).collect();

        let end = 2 + 2 * n;
        let mut code = vec![ (0, Op::Nop), (1, Op::Leave(end)) ];
        for j in 0..n {
            code.push((2 + 2 * j, Op::Pop));
            code.push((3 + 2 * j, Op::Leave(end)));
        }
        code.push((end, Op::Return));

        // present the clauses in an arbitrary order
        let mut order : Vec<_> = (0..n).collect();
        order.sort_by_key(|&j| (keys.get(j).copied().unwrap_or(0), j));
        let handlers = order.iter()
            .map(|&j| fx.clause(HandlerKind::Catch, (0, 2), (2 + 2 * j, 4 + 2 * j), Some(types[j])))
            .collect();

        let body = fx.body(&[], code, handlers);
        let m = match translate_method(&body, &mut fx.types, &mut fx.pool, &fx.config) {
            Ok(m) => m,
            Err(e) => return TestResult::error(e.to_string()),
        };
        let tested : Vec<_> = m.code.iter()
            .filter_map(|(_, i)| match i { Instruction::Instanceof(c) => Some(*c), _ => None })
            .collect();
        let expected : Result<Vec<_>, _> = (0..n).map(|j| fx.pool.class(&format!("demo/E{}", j))).collect();
        TestResult::from_bool(expected.ok() == Some(tested))
    }
}

#[test]
fn test_display_lists_frames_and_handlers() -> GeneralResult<()> {
    let mut fx = Fixture::new();
    let body = fx.body(&[], vec![ (0, Op::Jump(2)), (1, Op::Nop), (2, Op::Return) ], vec![]);
    let m = translate_method(&body, &mut fx.types, &mut fx.pool, &fx.config)?;
    let text = m.to_string();
    assert!(text.starts_with("run (stack 0, locals 0):"));
    assert!(text.contains("frame"));
    assert_eq!(Label::Source(2).to_string(), "IL_0002");
    Ok(())
}
