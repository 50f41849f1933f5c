//! Scope chain (spec §3, §4.1.4): a chained name -> value mapping. Lookups
//! walk up through parents until the first hit; writes target exactly one
//! scope (the current one, or the parent when `PARENT_SCOPE` is given).
//! Scopes are held in a flat arena referenced by index, so a function call's
//! child scope can be dropped on return without fighting the borrow
//! checker over parent pointers.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(pub usize);

#[derive(Debug, Default)]
struct Frame {
    vars: HashMap<String, String>,
    parent: Option<ScopeId>,
}

#[derive(Debug, Default)]
pub struct Scopes {
    arena: Vec<Frame>,
}

impl Scopes {
    pub fn new() -> Self {
        let mut s = Scopes { arena: Vec::new() };
        s.arena.push(Frame::default());
        s
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn child_of(&mut self, parent: ScopeId) -> ScopeId {
        self.arena.push(Frame {
            vars: HashMap::new(),
            parent: Some(parent),
        });
        ScopeId(self.arena.len() - 1)
    }

    pub fn get(&self, scope: ScopeId, name: &str) -> Option<&str> {
        let mut cur = Some(scope);
        while let Some(id) = cur {
            let frame = &self.arena[id.0];
            if let Some(v) = frame.vars.get(name) {
                return Some(v.as_str());
            }
            cur = frame.parent;
        }
        None
    }

    pub fn is_defined(&self, scope: ScopeId, name: &str) -> bool {
        self.get(scope, name).is_some()
    }

    pub fn set(&mut self, scope: ScopeId, name: &str, value: String) {
        self.arena[scope.0].vars.insert(name.to_string(), value);
    }

    /// Writes into the parent of `scope`; a no-op if `scope` is the root
    /// (mirrors `set(... PARENT_SCOPE)` at global scope being harmless).
    pub fn set_parent_scope(&mut self, scope: ScopeId, name: &str, value: String) {
        if let Some(parent) = self.arena[scope.0].parent {
            self.set(parent, name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_traverses_to_first_hit() {
        let mut s = Scopes::new();
        s.set(s.root(), "V", "outer".into());
        let child = s.child_of(s.root());
        assert_eq!(s.get(child, "V"), Some("outer"));
        s.set(child, "V", "inner".into());
        assert_eq!(s.get(child, "V"), Some("inner"));
        assert_eq!(s.get(s.root(), "V"), Some("outer"));
    }

    #[test]
    fn parent_scope_write_targets_the_parent_frame() {
        let mut s = Scopes::new();
        let child = s.child_of(s.root());
        s.set_parent_scope(child, "OUT", "value".into());
        assert_eq!(s.get(child, "OUT"), Some("value"));
        assert_eq!(s.get(s.root(), "OUT"), Some("value"));
    }
}
