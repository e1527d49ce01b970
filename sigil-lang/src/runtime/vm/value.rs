use std::{fmt, rc::Rc};

use super::garbagecollector::{Heap, ObjRef};
use super::program::FuncProto;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeId {
    Bool,
    Float,
    String,
    List,
    Function,
    TypeId,
}

impl TypeId {
    pub fn name(self) -> &'static str {
        match self {
            TypeId::Bool => "bool",
            TypeId::Float => "float",
            TypeId::String => "string",
            TypeId::List => "list",
            TypeId::Function => "function",
            TypeId::TypeId => "typeid",
        }
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    TypeId(TypeId),
    String(ObjRef),
    List(ObjRef),
    Function(ObjRef),
    Closure(ObjRef),
    Upvalue(ObjRef),
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    /// `None` for nil, which has no type id.
    pub fn type_id(&self) -> Option<TypeId> {
        match self {
            Value::Nil => None,
            Value::Bool(_) => Some(TypeId::Bool),
            Value::Number(_) => Some(TypeId::Float),
            Value::TypeId(_) => Some(TypeId::TypeId),
            Value::String(_) => Some(TypeId::String),
            Value::List(_) => Some(TypeId::List),
            Value::Function(_) | Value::Closure(_) | Value::Upvalue(_) => Some(TypeId::Function),
        }
    }

    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            Value::String(r)
            | Value::List(r)
            | Value::Function(r)
            | Value::Closure(r)
            | Value::Upvalue(r) => Some(*r),
            _ => None,
        }
    }

    /// Equality used for literal pool deduplication: numbers compare bitwise so
    /// that `0` and `-0` keep separate entries.
    pub(crate) fn same_literal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

/// Immutable string content with its hash computed once at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct InternedString {
    text: Rc<str>,
    hash: u64,
}

// FNV-1a
pub(crate) fn hash_str(s: &str) -> u64 {
    s.bytes().fold(0xcbf29ce484222325, |h, b| {
        (h ^ b as u64).wrapping_mul(0x100000001b3)
    })
}

impl InternedString {
    pub fn new(text: Rc<str>) -> Self {
        let hash = hash_str(&text);
        Self { text, hash }
    }
    pub fn as_str(&self) -> &str {
        &self.text
    }
    pub fn text(&self) -> Rc<str> {
        self.text.clone()
    }
    pub fn hash(&self) -> u64 {
        self.hash
    }
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
    /// Same index rules as [`List::get`], counted in characters.
    pub fn char_at(&self, index: i64) -> Option<char> {
        let i = normalize_index(index, self.char_count())?;
        self.text.chars().nth(i)
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let i = if index < 0 { index + len as i64 } else { index };
    (0..len as i64).contains(&i).then_some(i as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOutOfRange;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct List {
    values: Vec<Value>,
}

impl List {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    pub fn values(&self) -> &[Value] {
        &self.values
    }
    /// Negative indices count from the end, `-1` being the last element.
    pub fn get(&self, index: i64) -> Option<Value> {
        normalize_index(index, self.len()).map(|i| self.values[i])
    }
    /// Writing past the end grows the list, filling the gap with `nil`.
    /// Fails without touching the list if the index is before the start or the
    /// growth cannot be allocated.
    pub fn set(&mut self, index: i64, value: Value) -> Result<(), IndexOutOfRange> {
        let i = if index < 0 {
            index + self.len() as i64
        } else {
            index
        };
        if i < 0 {
            return Err(IndexOutOfRange);
        }
        let i = usize::try_from(i).map_err(|_| IndexOutOfRange)?;
        if i >= self.values.len() {
            let extra = (i - self.values.len())
                .checked_add(1)
                .ok_or(IndexOutOfRange)?;
            self.values
                .try_reserve(extra)
                .map_err(|_| IndexOutOfRange)?;
            self.values.resize(i + 1, Value::Nil);
        }
        self.values[i] = value;
        Ok(())
    }
    pub fn append(&mut self, value: Value) {
        self.values.push(value)
    }
    pub fn concat(&self, other: &List) -> List {
        let values = self.values.iter().chain(other.values.iter()).copied();
        List::new(values.collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// An open upvalue aliases an absolute stack slot; a closed one owns the value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    String(InternedString),
    List(List),
    Function(FuncProto),
    Closure(Closure),
    Upvalue(UpvalueState),
}

impl Object {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::String(_) => "string",
            Object::List(_) => "list",
            Object::Function(_) => "function",
            Object::Closure(_) => "closure",
            Object::Upvalue(_) => "upvalue",
        }
    }
}

/// `print` uses the plain form, `echo` and list elements the verbose one.
pub struct ValueDisplay<'a> {
    heap: &'a Heap,
    value: Value,
    verbose: bool,
}

impl Heap {
    pub fn display(&self, value: Value, verbose: bool) -> ValueDisplay<'_> {
        ValueDisplay {
            heap: self,
            value,
            verbose,
        }
    }
}

fn write_value(
    f: &mut fmt::Formatter<'_>,
    heap: &Heap,
    value: Value,
    verbose: bool,
    seen: &mut Vec<ObjRef>,
) -> fmt::Result {
    match value {
        Value::Nil => write!(f, "nil"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Number(n) => write!(f, "{n}"),
        Value::TypeId(t) if verbose => write!(f, "<type:{t}>"),
        Value::TypeId(t) => write!(f, "{t}"),
        Value::String(r) if verbose => write!(f, "\"{}\"", heap.string(r).as_str()),
        Value::String(r) => write!(f, "{}", heap.string(r).as_str()),
        Value::List(r) => {
            // a list may contain itself
            if seen.contains(&r) {
                return write!(f, "[...]");
            }
            seen.push(r);
            write!(f, "[")?;
            for (i, v) in heap.list(r).values().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write_value(f, heap, *v, true, seen)?;
            }
            seen.pop();
            write!(f, "]")
        }
        Value::Function(r) if verbose => write!(f, "<fn:{}>", heap.function(r).name(heap)),
        Value::Function(r) => write!(f, "{}", heap.function(r).name(heap)),
        Value::Closure(r) => {
            let name = heap.function(heap.closure(r).function).name(heap);
            if verbose {
                write!(f, "<cl:{name}>")
            } else {
                write!(f, "{name}")
            }
        }
        Value::Upvalue(_) => write!(f, "<upvalue>"),
    }
}

impl fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self.heap, self.value, self.verbose, &mut vec![])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn list_negative_indices() {
        let list = List::new(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]);
        assert_eq!(list.get(0), Some(Value::Number(1.0)));
        assert_eq!(list.get(-1), Some(Value::Number(3.0)));
        assert_eq!(list.get(-3), Some(Value::Number(1.0)));
        assert_eq!(list.get(-4), None);
        assert_eq!(list.get(3), None);
    }

    #[test]
    fn list_set_extends_with_nil() {
        let mut list = List::new(vec![Value::Number(1.0)]);
        list.set(3, Value::Bool(true)).unwrap();
        assert_eq!(
            list.values(),
            &[Value::Number(1.0), Value::Nil, Value::Nil, Value::Bool(true)]
        );
        list.set(-1, Value::Nil).unwrap();
        assert_eq!(list.get(3), Some(Value::Nil));
        assert_eq!(list.set(-5, Value::Nil), Err(IndexOutOfRange));
    }

    #[test]
    fn list_growth_that_cannot_be_allocated_fails() {
        let mut list = List::new(vec![Value::Number(1.0)]);
        assert_eq!(list.set(i64::MAX, Value::Nil), Err(IndexOutOfRange));
        assert_eq!(list.values(), &[Value::Number(1.0)]);
    }

    #[test]
    fn list_concat_keeps_operands() {
        let a = List::new(vec![Value::Number(1.0)]);
        let b = List::new(vec![Value::Bool(false)]);
        let c = a.concat(&b);
        assert_eq!(c.len(), 2);
        assert_eq!(a.len(), 1);
        assert_eq!(c.get(1), Some(Value::Bool(false)));
    }

    #[test]
    fn truthiness() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
        assert!(!Value::TypeId(TypeId::Bool).is_falsey());
    }

    #[test]
    fn string_chars() {
        let s = InternedString::new(Rc::from("héllo"));
        assert_eq!(s.char_at(1), Some('é'));
        assert_eq!(s.char_at(-1), Some('o'));
        assert_eq!(s.char_at(5), None);
        assert_eq!(s.hash(), InternedString::new(Rc::from("héllo")).hash());
    }
}
