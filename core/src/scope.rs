//! The scope table (`Environment`): a stack of nested symbol tables that
//! implements lexical scoping for the analyser, plus the small amount of
//! extra bookkeeping needed while analysing a procedure body.

use crate::ast::{ConstValue, Mode};
use std::collections::HashMap;
use std::rc::Rc;

/// One formal parameter of a declared procedure, as recorded in its
/// entity.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub mode: Mode,
    pub is_loc: bool,
    pub offset: isize,
}

/// A single named thing in the scope table: a variable, synonym, mode
/// alias, label, or procedure.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    pub raw_type: Mode,
    pub loc: bool,
    pub size: usize,
    pub offset: isize,
    pub scope: usize,
    /// Folded value, present only for synonyms.
    pub value: Option<ConstValue>,
    pub lower_bound_value: Option<i64>,
    pub upper_bound_value: Option<i64>,
    /// Present only for procedure entities.
    pub params: Option<Vec<ParamSpec>>,
    pub return_mode: Option<Mode>,
    pub return_offset: Option<isize>,
}

impl Entity {
    pub fn var(raw_type: Mode, loc: bool, size: usize, offset: isize, scope: usize) -> Self {
        Entity {
            raw_type,
            loc,
            size,
            offset,
            scope,
            value: None,
            lower_bound_value: None,
            upper_bound_value: None,
            params: None,
            return_mode: None,
            return_offset: None,
        }
    }

    pub fn synonym(raw_type: Mode, value: ConstValue, scope: usize) -> Self {
        Entity {
            raw_type,
            loc: false,
            size: 0,
            offset: 0,
            scope,
            value: Some(value),
            lower_bound_value: None,
            upper_bound_value: None,
            params: None,
            return_mode: None,
            return_offset: None,
        }
    }

    pub fn label(scope: usize) -> Self {
        Entity {
            raw_type: Mode::Void,
            loc: false,
            size: 0,
            offset: 0,
            scope,
            value: None,
            lower_bound_value: None,
            upper_bound_value: None,
            params: None,
            return_mode: None,
            return_offset: None,
        }
    }

    pub fn procedure(
        params: Vec<ParamSpec>,
        return_mode: Option<Mode>,
        return_offset: Option<isize>,
        scope: usize,
    ) -> Self {
        Entity {
            raw_type: Mode::Void,
            loc: false,
            size: 0,
            offset: 0,
            scope,
            value: None,
            lower_bound_value: None,
            upper_bound_value: None,
            params: Some(params),
            return_mode,
            return_offset,
        }
    }
}

/// One level of lexical nesting: global scope, or one procedure body.
struct Scope {
    /// This scope's *display level*: its 0-based depth in the static
    /// nesting chain (0 = global, 1 = a top-level procedure body, 2 = a
    /// procedure nested one level deeper, and so on). The machine's
    /// display register is indexed by this value, and -- unlike a unique
    /// scope id -- it is deliberately reused across sibling procedures at
    /// the same depth, exactly as `enf`/`ret` expect.
    level: usize,
    /// The enclosure tag this scope was pushed with, e.g.
    /// `"PROCEDURE DECLARATION fact"`. Used to recognise procedure scopes
    /// when unwinding the procedure-context stack.
    enclosure: String,
    entities: HashMap<String, Rc<Entity>>,
    /// Next free non-negative frame offset for a local declared here.
    next_offset: isize,
}

impl Scope {
    fn new(level: usize, enclosure: String) -> Self {
        Scope {
            level,
            enclosure,
            entities: HashMap::new(),
            next_offset: 0,
        }
    }
}

/// Per-procedure analysis state, collapsing the scope table's four
/// parallel auxiliary stacks (expected return spec, procedure scope id,
/// parameter-space accumulator, "has returned" flag) into one record
/// pushed per procedure.
#[derive(Clone, Debug, Default)]
pub struct ProcedureContext {
    pub expected_return: Option<Mode>,
    pub proc_scope: usize,
    pub parameter_space: usize,
    pub has_returned: bool,
}

/// The nested symbol-table stack used throughout analysis.
pub struct Environment {
    scopes: Vec<Scope>,
    proc_stack: Vec<ProcedureContext>,
}

impl Environment {
    pub fn new() -> Self {
        let mut env = Environment {
            scopes: Vec::new(),
            proc_stack: Vec::new(),
        };
        env.push("GLOBAL");
        env
    }

    /// Open a new scope, one display level deeper than the current one.
    /// `enclosure` identifies why the scope was opened; procedure bodies
    /// use `"PROCEDURE DECLARATION <name>"`.
    pub fn push(&mut self, enclosure: &str) -> usize {
        let level = self.scopes.len();
        self.scopes.push(Scope::new(level, enclosure.to_string()));
        level
    }

    /// Close the topmost scope. Entities already looked up and cloned
    /// elsewhere remain valid; only the table's own copy is dropped.
    pub fn pop(&mut self) {
        self.scopes.pop();
    }

    /// The current scope's display level -- the value `ldv`/`stv`/`enf`/
    /// `ret` address by.
    pub fn current_scope_id(&self) -> usize {
        self.scopes.last().expect("scope stack is never empty").level
    }

    pub fn current_enclosure(&self) -> &str {
        &self
            .scopes
            .last()
            .expect("scope stack is never empty")
            .enclosure
    }

    /// Reserve `size` contiguous non-negative slots in the current scope
    /// and return the offset of the first one.
    pub fn reserve_offset(&mut self, size: usize) -> isize {
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        let offset = scope.next_offset;
        scope.next_offset += size as isize;
        offset
    }

    /// Insert `entity` under `name` in the current scope. Returns the
    /// entity previously bound to `name` in this same scope, if any --
    /// the caller uses this to detect and report a redeclaration.
    pub fn add_local(&mut self, name: &str, entity: Entity) -> Option<Rc<Entity>> {
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        scope.entities.insert(name.to_string(), Rc::new(entity))
    }

    /// Insert `entity` under `name` in the scope directly enclosing the
    /// current one. Used to bind a procedure's own name (visible to its
    /// caller, and to itself for recursion) in the scope it was declared
    /// in, just before pushing the scope for its body.
    pub fn add_parent(&mut self, name: &str, entity: Entity) -> Option<Rc<Entity>> {
        let len = self.scopes.len();
        let parent = &mut self.scopes[len - 2];
        parent.entities.insert(name.to_string(), Rc::new(entity))
    }

    /// Find the nearest binding for `name`, walking from the innermost
    /// scope outward.
    pub fn lookup(&self, name: &str) -> Option<Rc<Entity>> {
        for scope in self.scopes.iter().rev() {
            if let Some(entity) = scope.entities.get(name) {
                return Some(Rc::clone(entity));
            }
        }
        None
    }

    /// Find a binding for `name` restricted to the current (innermost)
    /// scope only. Used to detect redeclarations.
    pub fn lookup_local(&self, name: &str) -> Option<Rc<Entity>> {
        self.scopes
            .last()
            .expect("scope stack is never empty")
            .entities
            .get(name)
            .map(Rc::clone)
    }

    pub fn push_procedure(&mut self, ctx: ProcedureContext) {
        self.proc_stack.push(ctx);
    }

    pub fn pop_procedure(&mut self) -> Option<ProcedureContext> {
        self.proc_stack.pop()
    }

    pub fn current_procedure(&self) -> Option<&ProcedureContext> {
        self.proc_stack.last()
    }

    pub fn current_procedure_mut(&mut self) -> Option<&mut ProcedureContext> {
        self.proc_stack.last_mut()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_nearest_binding() {
        let mut env = Environment::new();
        env.add_local("a", Entity::var(Mode::Int, false, 1, 0, 0));
        env.push("PROCEDURE DECLARATION f");
        env.add_local("a", Entity::var(Mode::Bool, false, 1, 0, 1));
        assert_eq!(env.lookup("a").unwrap().raw_type, Mode::Bool);
        env.pop();
        assert_eq!(env.lookup("a").unwrap().raw_type, Mode::Int);
    }

    #[test]
    fn redeclaration_is_detected_locally_not_across_scopes() {
        let mut env = Environment::new();
        env.add_local("a", Entity::var(Mode::Int, false, 1, 0, 0));
        assert!(env.lookup_local("a").is_some());
        env.push("PROCEDURE DECLARATION f");
        assert!(env.lookup_local("a").is_none());
        assert!(env.lookup("a").is_some());
    }

    #[test]
    fn offsets_increase_monotonically_within_a_scope() {
        let mut env = Environment::new();
        let first = env.reserve_offset(2);
        let second = env.reserve_offset(3);
        assert_eq!(first, 0);
        assert_eq!(second, 2);
    }
}
