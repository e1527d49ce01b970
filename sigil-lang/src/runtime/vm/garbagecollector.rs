use std::{collections::HashMap, rc::Rc};

use slotmap::{new_key_type, SlotMap};

use super::program::FuncProto;
use super::value::{hash_str, Closure, InternedString, List, Object, UpvalueState, Value};

new_key_type! {pub struct ObjRef;}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    /// Collect before every allocation.
    pub stress: bool,
    pub initial_threshold: usize,
    pub growth_factor: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            stress: false,
            initial_threshold: 1024,
            growth_factor: 2,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    pub freed: usize,
}

#[derive(Debug)]
struct HeapEntry {
    marked: bool,
    object: Object,
}

/// Anything that holds references into the heap which must survive a collection.
pub trait RootSource {
    fn mark_roots(&self, marker: &mut Marker<'_>);
}

/// Used by callers that hold no heap references of their own.
pub struct NoRoots;
impl RootSource for NoRoots {
    fn mark_roots(&self, _marker: &mut Marker<'_>) {}
}

impl<const N: usize> RootSource for [Value; N] {
    fn mark_roots(&self, marker: &mut Marker<'_>) {
        self.iter().for_each(|v| marker.mark_value(*v));
    }
}

impl RootSource for Vec<Value> {
    fn mark_roots(&self, marker: &mut Marker<'_>) {
        self.iter().for_each(|v| marker.mark_value(*v));
    }
}

fn push_children(object: &Object, out: &mut Vec<ObjRef>) {
    match object {
        Object::String(_) => {}
        Object::List(list) => out.extend(list.values().iter().filter_map(Value::as_object)),
        Object::Function(f) => {
            out.extend(f.name);
            out.extend(f.chunk.literals.iter().filter_map(Value::as_object));
        }
        Object::Closure(c) => {
            out.push(c.function);
            out.extend(c.upvalues.iter().copied());
        }
        Object::Upvalue(UpvalueState::Closed(v)) => out.extend(v.as_object()),
        // the aliased stack slot is a root on its own
        Object::Upvalue(UpvalueState::Open(_)) => {}
    }
}

pub struct Marker<'a> {
    objects: &'a mut SlotMap<ObjRef, HeapEntry>,
    gray: &'a mut Vec<ObjRef>,
}

impl Marker<'_> {
    pub fn mark_value(&mut self, value: Value) {
        if let Some(r) = value.as_object() {
            self.mark_object(r)
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let Some(entry) = self.objects.get_mut(r) else {
            debug_assert!(false, "marking a freed object {r:?}");
            return;
        };
        if entry.marked {
            return;
        }
        entry.marked = true;
        // strings have no children
        if !matches!(entry.object, Object::String(_)) {
            self.gray.push(r);
        }
    }

    /// Marks the children of an object that is not in the arena yet.
    fn mark_pending(&mut self, object: &Object) {
        let mut children = vec![];
        push_children(object, &mut children);
        children.into_iter().for_each(|c| self.mark_object(c));
    }

    fn trace(&mut self) {
        let mut children = vec![];
        while let Some(r) = self.gray.pop() {
            push_children(&self.objects[r].object, &mut children);
            for c in children.drain(..) {
                self.mark_object(c);
            }
        }
    }
}

pub struct Heap {
    objects: SlotMap<ObjRef, HeapEntry>,
    // weak: keyed by the cached content hash, entries are dropped when their
    // string is collected
    strings: HashMap<u64, Vec<ObjRef>>,
    gray: Vec<ObjRef>,
    empty_string: ObjRef,
    next_gc: usize,
    config: GcConfig,
    stats: GcStats,
}

impl Heap {
    pub fn new(config: GcConfig) -> Self {
        let mut objects = SlotMap::with_key();
        let empty = InternedString::new(Rc::from(""));
        let hash = empty.hash();
        let empty_string = objects.insert(HeapEntry {
            marked: false,
            object: Object::String(empty),
        });
        Self {
            objects,
            strings: HashMap::from([(hash, vec![empty_string])]),
            gray: vec![],
            empty_string,
            next_gc: config.initial_threshold,
            config,
            stats: GcStats::default(),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
    pub fn stats(&self) -> GcStats {
        self.stats
    }
    pub fn contains(&self, r: ObjRef) -> bool {
        self.objects.contains_key(r)
    }
    pub fn empty_string(&self) -> ObjRef {
        self.empty_string
    }

    /// May run a collection first; `object` itself is traced as part of it.
    pub fn alloc(&mut self, object: Object, roots: &dyn RootSource) -> ObjRef {
        if self.config.stress || self.objects.len() >= self.next_gc {
            self.collect_inner(roots, Some(&object));
        }
        self.objects.insert(HeapEntry {
            marked: false,
            object,
        })
    }

    /// Returns the one live string object with this content, allocating it if needed.
    pub fn intern(&mut self, text: &str, roots: &dyn RootSource) -> ObjRef {
        let hash = hash_str(text);
        let found = self.strings.get(&hash).and_then(|bucket| {
            bucket
                .iter()
                .find(|r| self.string(**r).as_str() == text)
                .copied()
        });
        if let Some(r) = found {
            return r;
        }
        let r = self.alloc(Object::String(InternedString::new(Rc::from(text))), roots);
        self.strings.entry(hash).or_default().push(r);
        r
    }

    pub fn collect(&mut self, roots: &dyn RootSource) {
        self.collect_inner(roots, None)
    }

    fn collect_inner(&mut self, roots: &dyn RootSource, pending: Option<&Object>) {
        let before = self.objects.len();
        log::debug!("-- gc begin ({before} objects)");
        let mut marker = Marker {
            objects: &mut self.objects,
            gray: &mut self.gray,
        };
        marker.mark_object(self.empty_string);
        roots.mark_roots(&mut marker);
        if let Some(object) = pending {
            marker.mark_pending(object);
        }
        marker.trace();

        let objects = &self.objects;
        self.strings.retain(|_, bucket| {
            bucket.retain(|r| objects.get(*r).is_some_and(|e| e.marked));
            !bucket.is_empty()
        });
        self.objects.retain(|_, entry| {
            let keep = entry.marked;
            entry.marked = false;
            keep
        });

        let after = self.objects.len();
        self.stats.collections += 1;
        self.stats.freed += before - after;
        self.next_gc = (after * self.config.growth_factor).max(self.config.initial_threshold);
        log::debug!(
            "-- gc end: collected {} ({before} -> {after}), next at {}",
            before - after,
            self.next_gc
        );
    }

    pub fn get(&self, r: ObjRef) -> &Object {
        &self.objects[r].object
    }
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        &mut self.objects[r].object
    }

    pub fn string(&self, r: ObjRef) -> &InternedString {
        match self.get(r) {
            Object::String(s) => s,
            other => unreachable!("expected a string, found a {}", other.kind_name()),
        }
    }
    pub fn list(&self, r: ObjRef) -> &List {
        match self.get(r) {
            Object::List(l) => l,
            other => unreachable!("expected a list, found a {}", other.kind_name()),
        }
    }
    pub fn list_mut(&mut self, r: ObjRef) -> &mut List {
        match self.get_mut(r) {
            Object::List(l) => l,
            other => unreachable!("expected a list, found a {}", other.kind_name()),
        }
    }
    pub fn function(&self, r: ObjRef) -> &FuncProto {
        match self.get(r) {
            Object::Function(f) => f,
            other => unreachable!("expected a function, found a {}", other.kind_name()),
        }
    }
    pub fn closure(&self, r: ObjRef) -> &Closure {
        match self.get(r) {
            Object::Closure(c) => c,
            other => unreachable!("expected a closure, found a {}", other.kind_name()),
        }
    }
    pub fn upvalue(&self, r: ObjRef) -> UpvalueState {
        match self.get(r) {
            Object::Upvalue(u) => *u,
            other => unreachable!("expected an upvalue, found a {}", other.kind_name()),
        }
    }
    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueState {
        match self.get_mut(r) {
            Object::Upvalue(u) => u,
            other => unreachable!("expected an upvalue, found a {}", other.kind_name()),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(GcConfig::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stress_heap() -> Heap {
        Heap::new(GcConfig {
            stress: true,
            ..Default::default()
        })
    }

    #[test]
    fn interning_gives_one_handle_per_content() {
        let mut heap = Heap::default();
        let a = heap.intern("hello", &NoRoots);
        let b = heap.intern("hello", &NoRoots);
        let c = heap.intern("world", &NoRoots);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.intern("", &NoRoots), heap.empty_string());
    }

    #[test]
    fn unreachable_objects_are_freed() {
        let mut heap = Heap::default();
        let base = heap.object_count();
        let kept = heap.alloc(Object::List(List::default()), &NoRoots);
        for _ in 0..10 {
            heap.alloc(Object::List(List::default()), &NoRoots);
        }
        assert_eq!(heap.object_count(), base + 11);
        heap.collect(&[Value::List(kept)]);
        assert_eq!(heap.object_count(), base + 1);
        assert!(heap.contains(kept));
        assert_eq!(heap.stats().freed, 10);
        assert!(heap.contains(heap.empty_string()));
    }

    #[test]
    fn interning_looks_up_by_cached_hash() {
        let mut heap = Heap::default();
        let a = heap.intern("héllo", &NoRoots);
        let hash = heap.string(a).hash();
        assert_eq!(hash, hash_str("héllo"));
        assert_eq!(heap.strings[&hash], vec![a]);
        assert_eq!(heap.intern("héllo", &NoRoots), a);
        heap.collect(&NoRoots);
        assert!(!heap.strings.contains_key(&hash));
    }

    #[test]
    fn weak_string_table_is_swept() {
        let mut heap = Heap::default();
        let s = heap.intern("transient", &NoRoots);
        heap.collect(&NoRoots);
        assert!(!heap.contains(s));
        let again = heap.intern("transient", &NoRoots);
        assert!(heap.contains(again));
        assert_eq!(heap.string(again).as_str(), "transient");
    }

    #[test]
    fn children_of_pending_object_survive() {
        let mut heap = stress_heap();
        let s = heap.intern("element", &NoRoots);
        // nothing roots `s` except the list being allocated
        let list = heap.alloc(Object::List(List::new(vec![Value::String(s)])), &NoRoots);
        assert!(heap.contains(s));
        assert_eq!(heap.list(list).get(0), Some(Value::String(s)));
    }

    #[test]
    fn tracing_follows_closures_and_upvalues() {
        let mut heap = stress_heap();
        let name = heap.intern("f", &NoRoots);
        let function = heap.alloc(
            Object::Function(FuncProto::new(Some(name))),
            &NoRoots,
        );
        let inner = heap.intern("captured", &NoRoots);
        let roots = [Value::Function(function), Value::String(inner)];
        let upvalue = heap.alloc(
            Object::Upvalue(UpvalueState::Closed(Value::String(inner))),
            &roots,
        );
        let closure = heap.alloc(
            Object::Closure(Closure {
                function,
                upvalues: vec![upvalue],
            }),
            &roots,
        );
        heap.collect(&[Value::Closure(closure)]);
        for r in [closure, function, name, upvalue, inner] {
            assert!(heap.contains(r));
        }
        heap.collect(&NoRoots);
        for r in [closure, function, name, upvalue, inner] {
            assert!(!heap.contains(r));
        }
    }

    #[test]
    fn self_referencing_list_is_collected() {
        let mut heap = Heap::default();
        let list = heap.alloc(Object::List(List::default()), &NoRoots);
        heap.list_mut(list).append(Value::List(list));
        heap.collect(&NoRoots);
        assert!(!heap.contains(list));
    }
}
