/// Resolver registry — the replica-local observer graph.
///
/// A resolver is anything that must react when the local viewer's permission
/// values change (show/hide an object, enable a tool, ...). Resolvers register
/// either against a set of definitions or globally. Each registration lives in
/// dense lists with a handle → position table, so registering appends and
/// deregistering is an O(1) swap-remove.
///
/// The registry holds resolvers weakly. An entry whose owner was dropped is
/// "expired" and is compacted the next time a sweep reaches it.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use thiserror::Error;

use crate::perm::conditions::VisibilityRule;
use crate::perm::ids::{DefIndex, ResolverHandle};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("Permission definition {0} not found")]
    DefinitionNotFound(DefIndex),
}

// ---------------------------------------------------------------------------
// PermissionResolver
// ---------------------------------------------------------------------------

/// A consumer of permission values.
pub trait PermissionResolver {
    /// Re-read whatever values this resolver depends on and apply side effects.
    fn resolve(&mut self, ctx: &mut ResolveContext<'_>);
}

pub type SharedResolver = Rc<RefCell<dyn PermissionResolver>>;

/// What a resolver sees while it runs.
///
/// Holds the registry mutably so a resolver may deregister itself (or any
/// other resolver) mid-pass.
pub struct ResolveContext<'a> {
    values: &'a [bool],
    registry: &'a mut ResolverRegistry,
    handle: ResolverHandle,
}

impl<'a> ResolveContext<'a> {
    /// Local viewer's value for `def`; unknown indices read as `false`.
    pub fn value(&self, def: DefIndex) -> bool {
        self.values.get(def.as_usize()).copied().unwrap_or(false)
    }

    /// Local viewer's values, indexed by `DefIndex`.
    pub fn values(&self) -> &[bool] {
        self.values
    }

    /// Handle of the resolver being run.
    pub fn handle(&self) -> ResolverHandle {
        self.handle
    }

    pub fn is_preexisting(&self) -> bool {
        self.registry.is_preexisting(self.handle)
    }

    pub fn deregister(&mut self, handle: ResolverHandle) -> bool {
        self.registry.deregister(handle)
    }

    pub fn deregister_self(&mut self) -> bool {
        self.registry.deregister(self.handle)
    }
}

// ---------------------------------------------------------------------------
// Dense list
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Entry {
    handle: ResolverHandle,
    resolver: Weak<RefCell<dyn PermissionResolver>>,
}

#[derive(Default)]
struct DenseList {
    entries: Vec<Entry>,
    position: HashMap<ResolverHandle, usize>,
}

impl DenseList {
    fn push(&mut self, entry: Entry) {
        self.position.insert(entry.handle, self.entries.len());
        self.entries.push(entry);
    }

    fn remove(&mut self, handle: ResolverHandle) -> bool {
        let Some(index) = self.position.remove(&handle) else {
            return false;
        };
        self.entries.swap_remove(index);
        if let Some(moved) = self.entries.get(index) {
            self.position.insert(moved.handle, index);
        }
        true
    }

    fn get(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Clone, Copy)]
enum ListRef {
    All,
    Global,
    Definition(usize),
}

/// Registration scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolverScope {
    Definitions(Vec<DefIndex>),
    Global,
}

// ---------------------------------------------------------------------------
// ResolverRegistry
// ---------------------------------------------------------------------------

pub struct ResolverRegistry {
    /// Every registration; the full-sweep list.
    all: DenseList,
    global: DenseList,
    by_def: Vec<DenseList>,
    scopes: HashMap<ResolverHandle, ResolverScope>,
    next_handle: u64,
    /// Handles below this were registered during bootstrap.
    session_start: Option<u64>,
}

impl ResolverRegistry {
    pub fn new(definition_count: usize) -> Self {
        ResolverRegistry {
            all: DenseList::default(),
            global: DenseList::default(),
            by_def: (0..definition_count).map(|_| DenseList::default()).collect(),
            scopes: HashMap::new(),
            next_handle: 0,
            session_start: None,
        }
    }

    fn allocate(&mut self) -> ResolverHandle {
        let handle = ResolverHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Register `resolver` against `defs`. Duplicate indices are collapsed.
    pub fn register(
        &mut self,
        resolver: &SharedResolver,
        defs: &[DefIndex],
    ) -> Result<ResolverHandle, ResolverError> {
        if let Some(bad) = defs.iter().find(|d| d.as_usize() >= self.by_def.len()) {
            return Err(ResolverError::DefinitionNotFound(*bad));
        }
        let mut scope: Vec<DefIndex> = Vec::with_capacity(defs.len());
        for d in defs {
            if !scope.contains(d) {
                scope.push(*d);
            }
        }

        let handle = self.allocate();
        let entry = Entry {
            handle,
            resolver: Rc::downgrade(resolver),
        };
        for d in &scope {
            self.by_def[d.as_usize()].push(entry.clone());
        }
        self.all.push(entry);
        self.scopes.insert(handle, ResolverScope::Definitions(scope));
        Ok(handle)
    }

    /// Register `resolver` for every change.
    pub fn register_global(&mut self, resolver: &SharedResolver) -> ResolverHandle {
        let handle = self.allocate();
        let entry = Entry {
            handle,
            resolver: Rc::downgrade(resolver),
        };
        self.global.push(entry.clone());
        self.all.push(entry);
        self.scopes.insert(handle, ResolverScope::Global);
        handle
    }

    /// Remove a registration from every list it is in. `false` if unknown.
    pub fn deregister(&mut self, handle: ResolverHandle) -> bool {
        let Some(scope) = self.scopes.remove(&handle) else {
            return false;
        };
        match scope {
            ResolverScope::Global => {
                self.global.remove(handle);
            }
            ResolverScope::Definitions(defs) => {
                for d in defs {
                    if let Some(list) = self.by_def.get_mut(d.as_usize()) {
                        list.remove(handle);
                    }
                }
            }
        }
        self.all.remove(handle);
        true
    }

    pub fn is_registered(&self, handle: ResolverHandle) -> bool {
        self.scopes.contains_key(&handle)
    }

    pub fn scope(&self, handle: ResolverHandle) -> Option<&ResolverScope> {
        self.scopes.get(&handle)
    }

    /// Mark the end of bootstrap. Resolvers registered before this call are
    /// "preexisting".
    pub fn begin_session(&mut self) {
        if self.session_start.is_none() {
            self.session_start = Some(self.next_handle);
        }
    }

    /// True for handles registered before `begin_session` (and for every
    /// handle while still bootstrapping).
    pub fn is_preexisting(&self, handle: ResolverHandle) -> bool {
        match self.session_start {
            Some(start) => handle.0 < start,
            None => true,
        }
    }

    /// Live registrations (expired ones included until compacted).
    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.len() == 0
    }

    /// Registrations scoped to `def`.
    pub fn len_for(&self, def: DefIndex) -> usize {
        self.by_def.get(def.as_usize()).map(DenseList::len).unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Notification
    // -----------------------------------------------------------------------

    /// Run one resolver (typically right after it registers). `false` if the
    /// handle is unknown or its owner is gone.
    pub fn resolve_one(&mut self, handle: ResolverHandle, values: &[bool]) -> bool {
        let Some(entry) = self.entry(handle) else {
            return false;
        };
        let Some(rc) = entry.resolver.upgrade() else {
            self.deregister(handle);
            return false;
        };
        let Ok(mut resolver) = rc.try_borrow_mut() else {
            return false;
        };
        let mut ctx = ResolveContext {
            values,
            registry: self,
            handle,
        };
        resolver.resolve(&mut ctx);
        true
    }

    /// Run every registered resolver once.
    pub fn notify_all(&mut self, values: &[bool]) {
        self.sweep(ListRef::All, values);
    }

    /// Run resolvers scoped to `def`, then global resolvers.
    pub fn notify_definition(&mut self, def: DefIndex, values: &[bool]) {
        if def.as_usize() < self.by_def.len() {
            self.sweep(ListRef::Definition(def.as_usize()), values);
        }
        self.sweep(ListRef::Global, values);
    }

    fn list(&self, which: ListRef) -> Option<&DenseList> {
        match which {
            ListRef::All => Some(&self.all),
            ListRef::Global => Some(&self.global),
            ListRef::Definition(i) => self.by_def.get(i),
        }
    }

    fn entry(&self, handle: ResolverHandle) -> Option<Entry> {
        self.all
            .position
            .get(&handle)
            .and_then(|i| self.all.get(*i))
            .cloned()
    }

    /// Walk the handles `which` holds at entry, last to first, skipping any
    /// deregistered since. Registrations made mid-pass wait for the next pass.
    fn sweep(&mut self, which: ListRef, values: &[bool]) {
        let pending: Vec<ResolverHandle> = self
            .list(which)
            .map(|l| l.entries.iter().map(|e| e.handle).collect())
            .unwrap_or_default();
        for handle in pending.into_iter().rev() {
            let Some(entry) = self.entry(handle) else {
                continue;
            };
            match entry.resolver.upgrade() {
                Some(rc) => {
                    // A resolver already running further up the stack is skipped.
                    let Ok(mut resolver) = rc.try_borrow_mut() else {
                        continue;
                    };
                    let mut ctx = ResolveContext {
                        values,
                        registry: self,
                        handle,
                    };
                    resolver.resolve(&mut ctx);
                }
                None => {
                    self.deregister(handle);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// VisibilityResolver
// ---------------------------------------------------------------------------

/// Sample resolver: evaluates a `VisibilityRule` and reports changes of the
/// "should be shown" state to a host callback.
pub struct VisibilityResolver {
    rule: VisibilityRule,
    visible: Option<bool>,
    on_change: Box<dyn FnMut(bool)>,
}

impl VisibilityResolver {
    pub fn new(rule: VisibilityRule, on_change: impl FnMut(bool) + 'static) -> Self {
        VisibilityResolver {
            rule,
            visible: None,
            on_change: Box::new(on_change),
        }
    }

    pub fn rule(&self) -> &VisibilityRule {
        &self.rule
    }

    /// Last computed state, `None` before the first resolve.
    pub fn visible(&self) -> Option<bool> {
        self.visible
    }
}

impl PermissionResolver for VisibilityResolver {
    fn resolve(&mut self, ctx: &mut ResolveContext<'_>) {
        let show = self.rule.should_show(ctx.values());
        if self.visible != Some(show) {
            self.visible = Some(show);
            (self.on_change)(show);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perm::conditions::{Condition, ConditionList, WhenConditionsMet};

    #[derive(Default)]
    struct Counter {
        calls: usize,
        last: Vec<bool>,
    }

    impl PermissionResolver for Counter {
        fn resolve(&mut self, ctx: &mut ResolveContext<'_>) {
            self.calls += 1;
            self.last = ctx.values().to_vec();
        }
    }

    fn counter() -> (Rc<RefCell<Counter>>, SharedResolver) {
        let c = Rc::new(RefCell::new(Counter::default()));
        let shared: SharedResolver = c.clone();
        (c, shared)
    }

    /// Deregisters a list of handles (possibly itself) when run.
    struct Remover {
        targets: Vec<ResolverHandle>,
        calls: usize,
    }

    impl PermissionResolver for Remover {
        fn resolve(&mut self, ctx: &mut ResolveContext<'_>) {
            self.calls += 1;
            for h in self.targets.drain(..) {
                if h == ctx.handle() {
                    ctx.deregister_self();
                } else {
                    ctx.deregister(h);
                }
            }
        }
    }

    #[test]
    fn test_register_and_notify_definition() {
        let mut reg = ResolverRegistry::new(2);
        let (a, a_dyn) = counter();
        let (b, b_dyn) = counter();
        let (g, g_dyn) = counter();
        reg.register(&a_dyn, &[DefIndex(0)]).unwrap();
        reg.register(&b_dyn, &[DefIndex(1)]).unwrap();
        reg.register_global(&g_dyn);

        reg.notify_definition(DefIndex(0), &[true, false]);
        assert_eq!(a.borrow().calls, 1);
        assert_eq!(b.borrow().calls, 0);
        assert_eq!(g.borrow().calls, 1);
        assert_eq!(a.borrow().last, vec![true, false]);

        reg.notify_all(&[false, false]);
        assert_eq!(a.borrow().calls, 2);
        assert_eq!(b.borrow().calls, 1);
        assert_eq!(g.borrow().calls, 2);
    }

    #[test]
    fn test_register_unknown_definition_rejected() {
        let mut reg = ResolverRegistry::new(1);
        let (_c, c_dyn) = counter();
        assert_eq!(
            reg.register(&c_dyn, &[DefIndex(3)]).unwrap_err(),
            ResolverError::DefinitionNotFound(DefIndex(3))
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn test_duplicate_definitions_collapsed() {
        let mut reg = ResolverRegistry::new(1);
        let (c, c_dyn) = counter();
        reg.register(&c_dyn, &[DefIndex(0), DefIndex(0)]).unwrap();
        assert_eq!(reg.len_for(DefIndex(0)), 1);
        reg.notify_definition(DefIndex(0), &[true]);
        assert_eq!(c.borrow().calls, 1);
    }

    #[test]
    fn test_deregister_removes_from_every_list() {
        let mut reg = ResolverRegistry::new(2);
        let (c, c_dyn) = counter();
        let h = reg.register(&c_dyn, &[DefIndex(0), DefIndex(1)]).unwrap();
        assert!(reg.is_registered(h));
        assert!(reg.deregister(h));
        assert!(!reg.deregister(h));
        assert!(!reg.is_registered(h));
        assert_eq!(reg.len_for(DefIndex(0)), 0);
        assert_eq!(reg.len_for(DefIndex(1)), 0);

        reg.notify_all(&[true, true]);
        assert_eq!(c.borrow().calls, 0);
    }

    #[test]
    fn test_deregister_keeps_positions_consistent() {
        let mut reg = ResolverRegistry::new(1);
        let counters: Vec<_> = (0..5).map(|_| counter()).collect();
        let handles: Vec<_> = counters
            .iter()
            .map(|(_, d)| reg.register(d, &[DefIndex(0)]).unwrap())
            .collect();
        // Remove the first and a middle entry; the rest must still be reachable.
        assert!(reg.deregister(handles[0]));
        assert!(reg.deregister(handles[2]));
        assert!(reg.deregister(handles[4]));
        assert!(reg.deregister(handles[1]));
        assert_eq!(reg.len(), 1);
        reg.notify_all(&[true]);
        assert_eq!(counters[3].0.borrow().calls, 1);
    }

    #[test]
    fn test_dropped_resolver_is_compacted() {
        let mut reg = ResolverRegistry::new(1);
        let (keep, keep_dyn) = counter();
        {
            let (_gone, gone_dyn) = counter();
            reg.register(&gone_dyn, &[DefIndex(0)]).unwrap();
        }
        reg.register(&keep_dyn, &[DefIndex(0)]).unwrap();
        assert_eq!(reg.len(), 2);

        reg.notify_all(&[true]);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.len_for(DefIndex(0)), 1);
        assert_eq!(keep.borrow().calls, 1);
    }

    #[test]
    fn test_resolver_deregisters_itself_mid_pass() {
        let mut reg = ResolverRegistry::new(1);
        let (a, a_dyn) = counter();
        let remover = Rc::new(RefCell::new(Remover {
            targets: vec![],
            calls: 0,
        }));
        let remover_dyn: SharedResolver = remover.clone();
        let (b, b_dyn) = counter();

        reg.register(&a_dyn, &[DefIndex(0)]).unwrap();
        let h = reg.register(&remover_dyn, &[DefIndex(0)]).unwrap();
        reg.register(&b_dyn, &[DefIndex(0)]).unwrap();
        remover.borrow_mut().targets.push(h);

        reg.notify_all(&[true]);
        assert_eq!(remover.borrow().calls, 1);
        assert_eq!(a.borrow().calls, 1);
        assert_eq!(b.borrow().calls, 1);
        assert!(!reg.is_registered(h));

        reg.notify_all(&[true]);
        assert_eq!(remover.borrow().calls, 1);
        assert_eq!(a.borrow().calls, 2);
    }

    #[test]
    fn test_resolver_deregisters_unvisited_entry() {
        let mut reg = ResolverRegistry::new(1);
        let (a, a_dyn) = counter();
        let (b, b_dyn) = counter();
        let remover = Rc::new(RefCell::new(Remover {
            targets: vec![],
            calls: 0,
        }));
        let remover_dyn: SharedResolver = remover.clone();

        let ha = reg.register(&a_dyn, &[DefIndex(0)]).unwrap();
        reg.register(&b_dyn, &[DefIndex(0)]).unwrap();
        reg.register(&remover_dyn, &[DefIndex(0)]).unwrap();
        remover.borrow_mut().targets.push(ha);

        // Downward pass: remover runs first and removes `a` before it is
        // reached. The swap moves remover itself into a's slot.
        reg.notify_all(&[true]);
        assert_eq!(remover.borrow().calls, 1);
        assert_eq!(b.borrow().calls, 1);
        assert_eq!(a.borrow().calls, 0);
        assert!(!reg.is_registered(ha));

        reg.notify_all(&[true]);
        assert_eq!(remover.borrow().calls, 2);
        assert_eq!(b.borrow().calls, 2);
    }

    #[test]
    fn test_each_resolver_runs_once_per_pass_under_removals() {
        let mut reg = ResolverRegistry::new(1);
        let counters: Vec<_> = (0..4).map(|_| counter()).collect();
        let handles: Vec<_> = counters
            .iter()
            .map(|(_, d)| reg.register(d, &[DefIndex(0)]).unwrap())
            .collect();
        let remover = Rc::new(RefCell::new(Remover {
            targets: vec![],
            calls: 0,
        }));
        let remover_dyn: SharedResolver = remover.clone();
        let hr = reg.register(&remover_dyn, &[DefIndex(0)]).unwrap();
        remover
            .borrow_mut()
            .targets
            .extend([handles[0], handles[2], hr]);

        reg.notify_definition(DefIndex(0), &[true]);
        assert_eq!(remover.borrow().calls, 1);
        assert_eq!(counters[0].0.borrow().calls, 0);
        assert_eq!(counters[1].0.borrow().calls, 1);
        assert_eq!(counters[2].0.borrow().calls, 0);
        assert_eq!(counters[3].0.borrow().calls, 1);
        assert_eq!(reg.len_for(DefIndex(0)), 2);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_preexisting_split_at_session_start() {
        let mut reg = ResolverRegistry::new(0);
        let (_a, a_dyn) = counter();
        let (_b, b_dyn) = counter();
        let early = reg.register_global(&a_dyn);
        assert!(reg.is_preexisting(early));
        reg.begin_session();
        let late = reg.register_global(&b_dyn);
        assert!(reg.is_preexisting(early));
        assert!(!reg.is_preexisting(late));
    }

    #[test]
    fn test_visibility_resolver_reports_changes_only() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let rule = VisibilityRule {
            conditions: ConditionList(vec![Condition::new(DefIndex(0), true, false)]),
            when_met: WhenConditionsMet::Hide,
        };
        let resolver = Rc::new(RefCell::new(VisibilityResolver::new(rule, move |show| {
            sink.borrow_mut().push(show)
        })));
        let shared: SharedResolver = resolver.clone();

        let mut reg = ResolverRegistry::new(1);
        reg.register(&shared, &resolver.borrow().rule().conditions.definitions())
            .unwrap();

        reg.notify_all(&[true]);
        reg.notify_all(&[true]);
        reg.notify_definition(DefIndex(0), &[false]);
        assert_eq!(*seen.borrow(), vec![false, true]);
        assert_eq!(resolver.borrow().visible(), Some(true));
    }
}
