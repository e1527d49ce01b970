use std::{cell::RefCell, fmt};

use string_interner::{backend::StringBackend, StringInterner};

/// Compile-time identifier table. Runtime strings live in the collected heap
/// instead (see `runtime::vm::garbagecollector`); this table only names
/// variables, parameters and functions while they are being resolved.
pub struct SessionGlobals {
    pub symbol_interner: StringInterner<StringBackend<usize>>,
}

thread_local!(static SESSION_GLOBALS: RefCell<SessionGlobals> = RefCell::new(
    SessionGlobals {
        symbol_interner: StringInterner::new(),
    }
));

pub fn with_session_globals<R, F>(f: F) -> R
where
    F: FnOnce(&mut SessionGlobals) -> R,
{
    SESSION_GLOBALS.with_borrow_mut(f)
}

#[derive(Default, Copy, Clone, PartialEq, Debug, Hash, Eq, PartialOrd, Ord)]
pub struct Symbol(pub usize); //Symbol Trait is implemented on usize

pub trait ToSymbol {
    fn to_symbol(&self) -> Symbol;
}

impl<T: AsRef<str>> ToSymbol for T {
    fn to_symbol(&self) -> Symbol {
        Symbol(with_session_globals(|session_globals| {
            session_globals.symbol_interner.get_or_intern(self.as_ref())
        }))
    }
}

impl Symbol {
    /// Run `f` over the interned text without copying it out of the table.
    pub fn with_str<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        with_session_globals(|session_globals| {
            f(session_globals
                .symbol_interner
                .resolve(self.0)
                .expect("invalid symbol"))
        })
    }
    pub fn is_empty(&self) -> bool {
        self.with_str(str::is_empty)
    }
}

// Note: to_string() is auto-implemented by this
impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_str(|s| write!(f, "{s}"))
    }
}
