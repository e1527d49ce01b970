//! Compile-time bookkeeping of locals and captured variables for every
//! function being compiled.

use crate::interner::{Symbol, ToSymbol};
use crate::runtime::vm::FuncProto;

pub const MAX_LOCALS: usize = 256;
pub const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct Local {
    pub name: Symbol,
    pub depth: usize,
    pub is_defined: bool,
    pub is_const: bool,
    pub is_captured: bool,
    /// Stands for an expression temporary that sat on the stack before a
    /// block-scoped local was declared mid-expression. Never emitted as a pop.
    pub is_temporary: bool,
}

impl Local {
    fn new(name: Symbol, depth: usize, is_const: bool) -> Self {
        Self {
            name,
            depth,
            is_defined: false,
            is_const,
            is_captured: false,
            is_temporary: false,
        }
    }
}

/// Where a closure finds one of its captured variables when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub index: u8,
    pub is_local: bool,
    pub is_const: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Local { slot: u8, is_const: bool },
    Upvalue { index: u8, is_const: bool },
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    ReadInOwnInitializer,
    AlreadyDeclared,
    TooManyLocals,
    TooManyUpvalues,
}

#[derive(Debug, Clone)]
pub struct Environment {
    pub kind: FunctionKind,
    pub proto: FuncProto,
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueDesc>,
    pub scope_depth: usize,
    /// Static operand stack height, slot 0 included.
    pub stack_height: i32,
    // declared locals whose initializer value is not on the stack yet
    shelves: Vec<Shelf>,
}

/// Locals detached by [`Environment::shelve_pending`]. In source order they sit
/// between `locals[..at]` and everything declared after them.
#[derive(Debug, Clone)]
struct Shelf {
    at: usize,
    locals: Vec<Local>,
}

impl Environment {
    /// Slot 0 holds the running closure. `slot0` is the function's own name so
    /// that direct recursion resolves locally; the script uses an empty name.
    pub fn new(kind: FunctionKind, proto: FuncProto, slot0: Symbol) -> Self {
        let mut callee = Local::new(slot0, 0, true);
        callee.is_defined = true;
        Self {
            kind,
            proto,
            locals: vec![callee],
            upvalues: vec![],
            scope_depth: 0,
            stack_height: 1,
            shelves: vec![],
        }
    }

    pub fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    /// Leaves the innermost scope and returns its locals, most recent first.
    pub fn end_scope(&mut self) -> Vec<Local> {
        self.scope_depth -= 1;
        let keep = self
            .locals
            .iter()
            .rposition(|l| l.depth <= self.scope_depth)
            .map_or(0, |i| i + 1);
        let mut popped = self.locals.split_off(keep);
        popped.reverse();
        popped
    }

    pub fn declare_local(&mut self, name: Symbol, is_const: bool) -> Result<u8, ResolveError> {
        let redeclared = self
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth >= self.scope_depth)
            .any(|l| l.name == name && !l.is_temporary);
        if redeclared {
            return Err(ResolveError::AlreadyDeclared);
        }
        self.push_local(Local::new(name, self.scope_depth, is_const))
    }

    /// Declares a local no source name can refer to.
    pub fn declare_hidden(&mut self) -> Result<u8, ResolveError> {
        let mut local = Local::new("".to_symbol(), self.scope_depth, false);
        local.is_defined = true;
        self.push_local(local)
    }

    /// Covers the expression temporaries currently above the last local.
    pub fn declare_temporaries(&mut self) -> Result<(), ResolveError> {
        while (self.locals.len() as i32) < self.stack_height {
            let mut local = Local::new("".to_symbol(), self.scope_depth, false);
            local.is_defined = true;
            local.is_temporary = true;
            self.push_local(local)?;
        }
        Ok(())
    }

    /// Detaches locals declared ahead of their value so that new locals line up
    /// with their stack slots. Returns how many were detached.
    pub fn shelve_pending(&mut self) -> usize {
        let height = self.stack_height.max(0) as usize;
        if self.locals.len() <= height {
            return 0;
        }
        let pending = self.locals.split_off(height);
        let count = pending.len();
        self.shelves.push(Shelf {
            at: height,
            locals: pending,
        });
        count
    }

    pub fn restore_pending(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(shelf) = self.shelves.pop() {
            debug_assert_eq!(shelf.locals.len(), count);
            self.locals.extend(shelf.locals);
        }
    }

    fn push_local(&mut self, local: Local) -> Result<u8, ResolveError> {
        if self.locals.len() >= MAX_LOCALS {
            return Err(ResolveError::TooManyLocals);
        }
        self.locals.push(local);
        Ok((self.locals.len() - 1) as u8)
    }

    pub fn mark_defined(&mut self) {
        if let Some(local) = self.locals.last_mut() {
            local.is_defined = true;
        }
    }

    /// Newest declaration first, so inner scopes shadow outer ones. Shelved
    /// locals shadow the ones declared before them but not the ones after.
    pub fn resolve_local(&self, name: Symbol) -> Result<Option<(u8, bool)>, ResolveError> {
        let mut end = self.locals.len();
        for shelf in self.shelves.iter().rev() {
            if let Some(found) = self.find_local(shelf.at, end, name) {
                return found;
            }
            if shelf.locals.iter().any(|l| l.name == name) {
                return Err(ResolveError::ReadInOwnInitializer);
            }
            end = shelf.at;
        }
        self.find_local(0, end, name).unwrap_or(Ok(None))
    }

    fn find_local(
        &self,
        start: usize,
        end: usize,
        name: Symbol,
    ) -> Option<Result<Option<(u8, bool)>, ResolveError>> {
        let (slot, local) = self.locals[start..end]
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name && !l.is_temporary)?;
        Some(if local.is_defined {
            Ok(Some(((start + slot) as u8, local.is_const)))
        } else {
            Err(ResolveError::ReadInOwnInitializer)
        })
    }

    pub fn add_upvalue(
        &mut self,
        index: u8,
        is_local: bool,
        is_const: bool,
    ) -> Result<u8, ResolveError> {
        if let Some(i) = self
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local)
        {
            return Ok(i as u8);
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err(ResolveError::TooManyUpvalues);
        }
        self.upvalues.push(UpvalueDesc {
            index,
            is_local,
            is_const,
        });
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// Looks `name` up in the functions enclosing `envs[level]`, threading an
/// upvalue through every function in between.
pub fn resolve_upvalue(
    envs: &mut [Environment],
    level: usize,
    name: Symbol,
) -> Result<Option<(u8, bool)>, ResolveError> {
    if level == 0 {
        return Ok(None);
    }
    if let Some((slot, is_const)) = envs[level - 1].resolve_local(name)? {
        envs[level - 1].locals[slot as usize].is_captured = true;
        let index = envs[level].add_upvalue(slot, true, is_const)?;
        return Ok(Some((index, is_const)));
    }
    if let Some((upvalue, is_const)) = resolve_upvalue(envs, level - 1, name)? {
        let index = envs[level].add_upvalue(upvalue, false, is_const)?;
        return Ok(Some((index, is_const)));
    }
    Ok(None)
}

/// Resolves `name` as seen from the innermost function.
pub fn resolve(envs: &mut [Environment], name: Symbol) -> Result<Resolved, ResolveError> {
    let level = envs.len() - 1;
    if let Some((slot, is_const)) = envs[level].resolve_local(name)? {
        return Ok(Resolved::Local { slot, is_const });
    }
    match resolve_upvalue(envs, level, name)? {
        Some((index, is_const)) => Ok(Resolved::Upvalue { index, is_const }),
        None => Ok(Resolved::Global),
    }
}
