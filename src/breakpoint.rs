//! The three-tier breakpoint graph: Seeds (user intent) resolve into
//! VirtualPoints (concrete targets), which share ActualPoints (one software
//! patch per code address, refcounted).
//!
//! Grounded on the C++ `BreakpointsControl`/`Breakpoints` pair
//! (`original_source/src/MAD/BreakpointsControl.cpp`,
//! `original_source/src/MAD/Breakpoints.cpp`): `ActualPoint::Up`/`Down`
//! refcounting, `GetOrCreateActualBreakpoint`, the `PendingSeeds` clone-then-
//! iterate pattern in `TryToInstantiateAllPendingSeeds`, and the
//! `__dyld_debugger_notification` self-removing sync breakpoint in
//! `BreakpointsControl::Attach`. The design notes (spec §9) call for dense
//! integer handles rather than the original's `shared_ptr` graph, so the
//! three tiers live in arenas owned only by [`Controller`].

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Kind, Result};
use crate::thread::ThreadState;

pub type SeedId = u64;
pub type VPointId = u64;
pub type APointId = u64;

/// Single-byte `INT3`. The sole breakpoint mechanism this controller supports
/// (spec §9, open question 3: treat the patch as byte-granularity, not a
/// `uintptr_t`-sized write).
const TRAP_OPCODE: u8 = 0xCC;

bitflags::bitflags! {
    /// What a seed callback wants done once every callback bound to the hit
    /// APoint has run. Aggregated across callbacks with bitwise OR (spec
    /// §4.7 step 5); other directives from the original source
    /// (`STEP_OVER`, `REMOVE`, `MOVE_TO_BREAKPOINT`) are folded into
    /// controller policy rather than exposed here (spec §9, open question 2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Directives: u8 {
        const CONTINUE = 0b01;
        const BREAK = 0b10;
    }
}

/// What fired for a seed's callback: enough context to report without the
/// callback reaching back into the controller.
#[derive(Debug, Clone)]
pub enum SeedEvent<'a> {
    Address(u64),
    Symbol(&'a str),
}

pub type Callback = Box<dyn FnMut(SeedEvent<'_>) -> Directives>;

/// Whether a resolved seed should be dropped from `PendingSeeds` once it has
/// produced at least one VPoint, or stay pending forever so it keeps
/// matching newly mapped code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingPolicy {
    RemoveOnResolve,
    Keep,
}

/// User intent. Regex/class/file/file+line are reserved per spec §4.7 but
/// their resolution is not implemented in this minimum spec; they remain
/// permanently pending (`Keep`) the same as a regex would once hooked up.
#[derive(Debug, Clone)]
pub enum SeedKind {
    Address(u64),
    Symbol(String),
    Regex(String),
    Class(String),
    File(String),
    FileLine(String, u32),
}

impl SeedKind {
    fn pending_policy(&self) -> PendingPolicy {
        match self {
            Self::Address(_) | Self::Symbol(_) => PendingPolicy::RemoveOnResolve,
            Self::Regex(_) | Self::Class(_) | Self::File(_) | Self::FileLine(..) => {
                PendingPolicy::Keep
            }
        }
    }
}

struct Seed {
    kind: SeedKind,
    pending_policy: PendingPolicy,
    callback: Callback,
}

/// A concrete resolved target. Distinct VPoints may resolve to the same
/// address (e.g. two aliasing symbols) and therefore share one APoint.
enum VPointTarget {
    Address(u64),
    Symbol { name: String, value: u64 },
}

struct VPoint {
    target: VPointTarget,
    address: u64,
}

/// One software breakpoint per code address. The patch is installed iff
/// `hold_count > 0` (invariant 1 in spec §4.7).
struct APoint {
    address: u64,
    hold_count: u32,
    active: bool,
    original_byte: Option<u8>,
}

/// Outcome of dispatching a `stopped(SIGTRAP)` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOutcome {
    /// No APoint at `pc - 1`; not a breakpoint this controller owns.
    Unknown,
    /// Every fired callback voted `CONTINUE` (or the hit was the internal
    /// dyld-sync breakpoint, which always continues).
    Continue,
    /// At least one fired callback voted `BREAK`.
    Break,
}

/// The capability [`Controller`] needs from whatever is being debugged:
/// symbol lookup for seed resolution, thread register access for PC rewind,
/// and byte-granularity patch/restore. Lets the graph logic be exercised in
/// tests against a fake target instead of a real task port.
pub trait DebugTarget {
    /// Resolves `name` against the images loaded in the target, in the
    /// order defined by spec §9 open question 1: executable first, then
    /// shared libraries in load order, dynamic linker last. Returns the
    /// (already ASLR-slid) value of the first match.
    fn resolve_symbol(&self, name: &str) -> Option<u64>;
    fn read_byte(&self, address: u64) -> Result<u8>;
    fn write_byte(&self, address: u64, byte: u8) -> Result<()>;
    fn stopped_thread_state(&self) -> Result<ThreadState>;
    fn set_stopped_thread_state(&self, state: &ThreadState) -> Result<()>;
    /// Single-steps the target one instruction. Used only as the middle
    /// step of `disable; step; enable` when crossing an active APoint.
    fn single_step(&self) -> Result<()>;
}

/// Owns the three tiers and their bidirectional relations. Nothing in the
/// graph owns anything else; everything is a dense integer handle into one
/// of the controller's own maps (spec §9).
#[derive(Default)]
pub struct Controller {
    seeds: HashMap<SeedId, Seed>,
    next_seed_id: SeedId,
    vpoints: HashMap<VPointId, VPoint>,
    next_vpoint_id: VPointId,
    apoints: HashMap<APointId, APoint>,
    next_apoint_id: APointId,

    seed_to_vpoints: HashMap<SeedId, HashSet<VPointId>>,
    vpoint_to_seeds: HashMap<VPointId, HashSet<SeedId>>,
    vpoint_to_apoint: HashMap<VPointId, APointId>,
    apoint_to_vpoints: HashMap<APointId, HashSet<VPointId>>,
    apoint_by_address: HashMap<u64, APointId>,

    pending_seeds: HashSet<SeedId>,

    /// The controller-owned synchronization breakpoint installed on attach,
    /// if any (spec §4.7 "Attach sequence").
    dyld_sync_seed: Option<SeedId>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a seed and makes one attempt to resolve it immediately (e.g.
    /// against whatever images are already mapped). Returns its id
    /// regardless of whether resolution succeeded; unresolved seeds stay in
    /// `PendingSeeds`.
    pub fn add_seed(&mut self, kind: SeedKind, callback: Callback, target: Option<&dyn DebugTarget>) -> Result<SeedId> {
        let id = self.next_seed_id;
        self.next_seed_id += 1;
        let pending_policy = kind.pending_policy();
        self.seeds.insert(
            id,
            Seed {
                kind,
                pending_policy,
                callback,
            },
        );
        self.pending_seeds.insert(id);
        if let Some(target) = target {
            self.try_resolve(id, target)?;
        }
        Ok(id)
    }

    pub fn add_symbol_seed(
        &mut self,
        symbol_name: impl Into<String>,
        callback: Callback,
        target: Option<&dyn DebugTarget>,
    ) -> Result<SeedId> {
        self.add_seed(SeedKind::Symbol(symbol_name.into()), callback, target)
    }

    pub fn add_address_seed(
        &mut self,
        address: u64,
        callback: Callback,
        target: Option<&dyn DebugTarget>,
    ) -> Result<SeedId> {
        self.add_seed(SeedKind::Address(address), callback, target)
    }

    /// Removes a seed: unlinks it from every VPoint it reached, down-counts
    /// (and restores, if the count hits zero) the APoints those VPoints
    /// referenced, and drops the seed from every tier.
    pub fn remove_seed(&mut self, id: SeedId, target: &dyn DebugTarget) -> Result<()> {
        self.remove_seed_inner(id, Some(target))
    }

    /// Removes a seed known to hold no VPoints (nothing to patch back), e.g.
    /// one added while no process was attached and never resolved. Returns
    /// `Kind::Breakpoint` if the seed turns out to own live VPoints after
    /// all — that would mean a VPoint survived a `Controller::detach`, which
    /// never happens in normal operation.
    pub fn remove_seed_pending_only(&mut self, id: SeedId) -> Result<()> {
        self.remove_seed_inner(id, None)
    }

    fn remove_seed_inner(&mut self, id: SeedId, target: Option<&dyn DebugTarget>) -> Result<()> {
        let Some(vpoint_ids) = self.seed_to_vpoints.remove(&id) else {
            self.seeds.remove(&id);
            self.pending_seeds.remove(&id);
            return Ok(());
        };

        let target = target.ok_or_else(|| {
            Error::internal(
                Kind::Breakpoint,
                "seed owns VPoints but no target was given to restore their patches",
            )
            .context("seed", id)
        })?;

        for vpoint_id in vpoint_ids {
            if let Some(seeds) = self.vpoint_to_seeds.get_mut(&vpoint_id) {
                seeds.remove(&id);
                if !seeds.is_empty() {
                    continue;
                }
            }
            self.unlink_vpoint(vpoint_id, target)?;
        }

        self.seeds.remove(&id);
        self.pending_seeds.remove(&id);
        Ok(())
    }

    fn unlink_vpoint(&mut self, vpoint_id: VPointId, target: &dyn DebugTarget) -> Result<()> {
        self.vpoint_to_seeds.remove(&vpoint_id);
        self.vpoints.remove(&vpoint_id);
        let Some(apoint_id) = self.vpoint_to_apoint.remove(&vpoint_id) else {
            return Ok(());
        };
        if let Some(vpoints) = self.apoint_to_vpoints.get_mut(&apoint_id) {
            vpoints.remove(&vpoint_id);
        }
        self.down(apoint_id, target)
    }

    /// Attempts to resolve every pending seed against `target`, snapshotting
    /// the pending set first so a seed resolved mid-iteration (or removed by
    /// its own callback, for the dyld-sync seed) can't be mutated while it's
    /// being iterated (spec §5: dispatch operates on a snapshot).
    pub fn try_resolve_all_pending(&mut self, target: &dyn DebugTarget) -> Result<()> {
        let snapshot: Vec<SeedId> = self.pending_seeds.iter().copied().collect();
        for id in snapshot {
            if self.seeds.contains_key(&id) {
                self.try_resolve(id, target)?;
            }
        }
        Ok(())
    }

    /// Tries to resolve one seed. Returns whether it (at least partially)
    /// resolved. Unimplemented seed kinds (regex/class/file/file+line)
    /// always report unresolved, per spec §4.7.
    fn try_resolve(&mut self, id: SeedId, target: &dyn DebugTarget) -> Result<bool> {
        let kind = self.seeds.get(&id).map(|s| s.kind.clone());
        let Some(kind) = kind else { return Ok(false) };

        let resolved = match kind {
            SeedKind::Address(address) => {
                self.instantiate(id, VPointTarget::Address(address), address, target)?;
                true
            }
            SeedKind::Symbol(name) => match target.resolve_symbol(&name) {
                Some(value) => {
                    self.instantiate(id, VPointTarget::Symbol { name, value }, value, target)?;
                    true
                }
                None => false,
            },
            SeedKind::Regex(_) | SeedKind::Class(_) | SeedKind::File(_) | SeedKind::FileLine(..) => {
                false
            }
        };

        if resolved {
            let policy = self.seeds.get(&id).map(|s| s.pending_policy);
            if policy == Some(PendingPolicy::RemoveOnResolve) {
                self.pending_seeds.remove(&id);
            }
        }

        Ok(resolved)
    }

    /// Creates a VPoint at `address` (reusing an existing APoint there if
    /// one exists) and links it to `seed_id` on both sides of the relation.
    fn instantiate(
        &mut self,
        seed_id: SeedId,
        vpoint_target: VPointTarget,
        address: u64,
        target: &dyn DebugTarget,
    ) -> Result<()> {
        let apoint_id = self.get_or_create_apoint(address);

        let vpoint_id = self.next_vpoint_id;
        self.next_vpoint_id += 1;
        self.vpoints.insert(
            vpoint_id,
            VPoint {
                target: vpoint_target,
                address,
            },
        );

        self.seed_to_vpoints.entry(seed_id).or_default().insert(vpoint_id);
        self.vpoint_to_seeds.entry(vpoint_id).or_default().insert(seed_id);
        self.vpoint_to_apoint.insert(vpoint_id, apoint_id);
        self.apoint_to_vpoints.entry(apoint_id).or_default().insert(vpoint_id);

        self.up(apoint_id, target)
    }

    fn get_or_create_apoint(&mut self, address: u64) -> APointId {
        if let Some(&id) = self.apoint_by_address.get(&address) {
            return id;
        }
        let id = self.next_apoint_id;
        self.next_apoint_id += 1;
        self.apoints.insert(
            id,
            APoint {
                address,
                hold_count: 0,
                active: false,
                original_byte: None,
            },
        );
        self.apoint_by_address.insert(address, id);
        id
    }

    /// Increments an APoint's hold-count, installing the patch on the 0->1
    /// transition.
    fn up(&mut self, id: APointId, target: &dyn DebugTarget) -> Result<()> {
        let address = {
            let apoint = self.apoints.get_mut(&id).expect("apoint id is valid");
            apoint.hold_count += 1;
            if apoint.hold_count != 1 {
                return Ok(());
            }
            apoint.address
        };
        self.enable(id, address, target)
    }

    /// Decrements an APoint's hold-count, removing the patch on the 1->0
    /// transition.
    fn down(&mut self, id: APointId, target: &dyn DebugTarget) -> Result<()> {
        let address = {
            let apoint = self.apoints.get_mut(&id).expect("apoint id is valid");
            assert!(apoint.hold_count > 0, "down() on an already-idle APoint");
            apoint.hold_count -= 1;
            if apoint.hold_count != 0 {
                return Ok(());
            }
            apoint.address
        };
        self.disable(id, address, target)
    }

    fn enable(&mut self, id: APointId, address: u64, target: &dyn DebugTarget) -> Result<()> {
        let original = target.read_byte(address).map_err(|e| {
            Error::internal(Kind::Breakpoint, "could not set breakpoint").context(
                "address",
                format!("{address:#x} ({e})"),
            )
        })?;
        target.write_byte(address, TRAP_OPCODE).map_err(|e| {
            Error::internal(Kind::Breakpoint, "could not set breakpoint").context(
                "address",
                format!("{address:#x} ({e})"),
            )
        })?;
        let apoint = self.apoints.get_mut(&id).expect("apoint id is valid");
        apoint.original_byte = Some(original);
        apoint.active = true;
        Ok(())
    }

    fn disable(&mut self, id: APointId, address: u64, target: &dyn DebugTarget) -> Result<()> {
        let original = self
            .apoints
            .get(&id)
            .and_then(|a| a.original_byte)
            .ok_or_else(|| {
                Error::internal(Kind::Breakpoint, "no original byte saved").context(
                    "address",
                    format!("{address:#x}"),
                )
            })?;
        target.write_byte(address, original).map_err(|e| {
            Error::internal(Kind::Breakpoint, "could not remove breakpoint").context(
                "address",
                format!("{address:#x} ({e})"),
            )
        })?;
        let apoint = self.apoints.get_mut(&id).expect("apoint id is valid");
        apoint.active = false;
        Ok(())
    }

    /// Installs the controller-owned synchronization breakpoint on the
    /// dynamic linker's post-mapping notification symbol. Its callback
    /// resolves every pending seed (shared libraries are now mapped) and
    /// removes itself in the same step the original does
    /// (`BreakpointsControl::Attach`), rather than a two-phase remove-then-continue.
    pub fn attach(&mut self, target: &dyn DebugTarget) -> Result<()> {
        let id = self.add_symbol_seed(
            "__dyld_debugger_notification",
            Box::new(|_| Directives::CONTINUE),
            Some(target),
        )?;
        self.dyld_sync_seed = Some(id);
        Ok(())
    }

    /// Required preamble to every continue (spec §4.7 "Step-over-current"):
    /// if standing on an active APoint, disable it, single-step past it,
    /// then re-enable it.
    pub fn step_over_if_needed(&mut self, target: &dyn DebugTarget) -> Result<()> {
        let pc = target.stopped_thread_state()?.pc();
        let Some(&id) = self.apoint_by_address.get(&pc) else {
            return Ok(());
        };
        if !self.apoints.get(&id).is_some_and(|a| a.active) {
            return Ok(());
        }

        self.disable(id, pc, target)?;
        target.single_step()?;
        self.enable(id, pc, target)?;
        Ok(())
    }

    /// Dispatches a `stopped(SIGTRAP)` event: identifies the APoint that
    /// trapped, rewinds `pc`, fires every bound seed's callback once, and
    /// aggregates their directives with OR (spec §4.7 "Hit dispatch").
    pub fn hit_dispatch(&mut self, target: &dyn DebugTarget) -> Result<HitOutcome> {
        let mut state = target.stopped_thread_state()?;
        let trapped_at = state.pc().wrapping_sub(1);

        let Some(&apoint_id) = self.apoint_by_address.get(&trapped_at) else {
            return Ok(HitOutcome::Unknown);
        };
        if !self.apoints.get(&apoint_id).is_some_and(|a| a.active) {
            return Ok(HitOutcome::Unknown);
        }

        state.set_pc(trapped_at);
        target.set_stopped_thread_state(&state)?;

        // Snapshot the VPoints/Seeds bound to this hit before invoking any
        // callback: a callback may call `remove_seed`, which must not
        // mutate the collection this loop is iterating (spec §5).
        let vpoint_ids: Vec<VPointId> = self
            .apoint_to_vpoints
            .get(&apoint_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let mut seed_ids = HashSet::new();
        for vpoint_id in vpoint_ids {
            if let Some(seeds) = self.vpoint_to_seeds.get(&vpoint_id) {
                seed_ids.extend(seeds.iter().copied());
            }
        }

        let is_dyld_sync = |id: SeedId, this: &Self| this.dyld_sync_seed == Some(id);

        let mut directives = Directives::empty();
        for seed_id in seed_ids {
            if is_dyld_sync(seed_id, self) {
                self.try_resolve_all_pending(target)?;
                self.remove_seed(seed_id, target)?;
                self.dyld_sync_seed = None;
                directives |= Directives::CONTINUE;
                continue;
            }

            let Some(seed) = self.seeds.get_mut(&seed_id) else {
                continue;
            };
            let event = match &seed.kind {
                SeedKind::Address(a) => SeedEvent::Address(*a),
                SeedKind::Symbol(name) => SeedEvent::Symbol(name.as_str()),
                _ => SeedEvent::Address(trapped_at),
            };
            directives |= (seed.callback)(event);
        }

        Ok(if directives.contains(Directives::BREAK) {
            HitOutcome::Break
        } else {
            HitOutcome::Continue
        })
    }

    /// If the target is still valid, disables every active APoint (patches
    /// restored before detach, per spec §4.6). Clears all three tiers and
    /// repopulates `PendingSeeds` from the full seed set so a later `run`
    /// re-resolves everything against the next process image.
    pub fn detach(&mut self, target: Option<&dyn DebugTarget>) -> Result<()> {
        if let Some(target) = target {
            let active: Vec<(APointId, u64)> = self
                .apoints
                .iter()
                .filter(|(_, a)| a.active)
                .map(|(&id, a)| (id, a.address))
                .collect();
            for (id, address) in active {
                self.disable(id, address, target)?;
            }
        }

        self.apoints.clear();
        self.apoint_by_address.clear();
        self.apoint_to_vpoints.clear();
        self.vpoints.clear();
        self.vpoint_to_apoint.clear();
        self.vpoint_to_seeds.clear();
        self.seed_to_vpoints.clear();

        self.pending_seeds = self.seeds.keys().copied().collect();
        self.dyld_sync_seed = None;
        Ok(())
    }

    #[cfg(test)]
    fn hold_count(&self, address: u64) -> Option<u32> {
        self.apoint_by_address
            .get(&address)
            .and_then(|id| self.apoints.get(id))
            .map(|a| a.hold_count)
    }

    #[cfg(test)]
    fn is_active(&self, address: u64) -> bool {
        self.apoint_by_address
            .get(&address)
            .and_then(|id| self.apoints.get(id))
            .is_some_and(|a| a.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap as Map;

    /// An in-memory target: a byte buffer plus a name->address symbol table,
    /// with no real process behind it. Exercises the graph/patch logic
    /// without a task port.
    struct FakeTarget {
        memory: RefCell<Map<u64, u8>>,
        symbols: Map<&'static str, u64>,
        pc: RefCell<u64>,
    }

    impl FakeTarget {
        fn new() -> Self {
            Self {
                memory: RefCell::new(Map::new()),
                symbols: Map::new(),
                pc: RefCell::new(0),
            }
        }

        fn poke(&self, address: u64, byte: u8) {
            self.memory.borrow_mut().insert(address, byte);
        }

        fn with_symbol(mut self, name: &'static str, address: u64) -> Self {
            self.symbols.insert(name, address);
            self
        }

        fn byte_at(&self, address: u64) -> u8 {
            *self.memory.borrow().get(&address).unwrap_or(&0)
        }
    }

    impl DebugTarget for FakeTarget {
        fn resolve_symbol(&self, name: &str) -> Option<u64> {
            self.symbols.get(name).copied()
        }

        fn read_byte(&self, address: u64) -> Result<u8> {
            Ok(self.byte_at(address))
        }

        fn write_byte(&self, address: u64, byte: u8) -> Result<()> {
            self.memory.borrow_mut().insert(address, byte);
            Ok(())
        }

        fn stopped_thread_state(&self) -> Result<ThreadState> {
            let mut state = ThreadState::default();
            state.set_pc(*self.pc.borrow());
            Ok(state)
        }

        fn set_stopped_thread_state(&self, state: &ThreadState) -> Result<()> {
            *self.pc.borrow_mut() = state.pc();
            Ok(())
        }

        fn single_step(&self) -> Result<()> {
            *self.pc.borrow_mut() += 1;
            Ok(())
        }
    }

    #[test]
    fn address_seed_installs_and_removes_patch() {
        let target = FakeTarget::new();
        target.poke(0x1000, 0x55);
        let mut ctrl = Controller::new();

        let id = ctrl
            .add_address_seed(0x1000, Box::new(|_| Directives::CONTINUE), Some(&target))
            .unwrap();
        assert_eq!(target.byte_at(0x1000), TRAP_OPCODE);
        assert_eq!(ctrl.hold_count(0x1000), Some(1));

        ctrl.remove_seed(id, &target).unwrap();
        assert_eq!(target.byte_at(0x1000), 0x55, "original byte restored");
        assert_eq!(ctrl.hold_count(0x1000), None);
    }

    #[test]
    fn two_seeds_at_same_address_share_one_apoint() {
        let target = FakeTarget::new()
            .with_symbol("_foo", 0x2000)
            .with_symbol("_foo_alias", 0x2000);
        target.poke(0x2000, 0xAA);
        let mut ctrl = Controller::new();

        let foo = ctrl
            .add_symbol_seed("_foo", Box::new(|_| Directives::BREAK), Some(&target))
            .unwrap();
        let alias = ctrl
            .add_symbol_seed(
                "_foo_alias",
                Box::new(|_| Directives::CONTINUE),
                Some(&target),
            )
            .unwrap();
        assert_eq!(ctrl.hold_count(0x2000), Some(2));

        ctrl.remove_seed(foo, &target).unwrap();
        // One VPoint down; the alias's VPoint still holds the APoint.
        assert_eq!(ctrl.hold_count(0x2000), Some(1));
        assert!(ctrl.is_active(0x2000));

        ctrl.remove_seed(alias, &target).unwrap();
        assert_eq!(ctrl.hold_count(0x2000), None);
    }

    #[test]
    fn hit_with_break_and_continue_votes_aggregates_to_break() {
        let target = FakeTarget::new()
            .with_symbol("_foo", 0x3000)
            .with_symbol("_foo_alias", 0x3000);
        target.poke(0x3000, 0x90);
        let mut ctrl = Controller::new();
        ctrl.add_symbol_seed("_foo", Box::new(|_| Directives::BREAK), Some(&target))
            .unwrap();
        ctrl.add_symbol_seed(
            "_foo_alias",
            Box::new(|_| Directives::CONTINUE),
            Some(&target),
        )
        .unwrap();

        // The trap executed, landing pc one byte past the patched address.
        *target.pc.borrow_mut() = 0x3001;
        let outcome = ctrl.hit_dispatch(&target).unwrap();
        assert_eq!(outcome, HitOutcome::Break);
        assert_eq!(*target.pc.borrow(), 0x3000, "pc rewound to the breakpoint");
    }

    #[test]
    fn inactive_apoint_is_not_a_hit() {
        let target = FakeTarget::new();
        target.poke(0x4000, 0x90);
        let mut ctrl = Controller::new();
        let id = ctrl
            .add_address_seed(0x4000, Box::new(|_| Directives::BREAK), Some(&target))
            .unwrap();
        ctrl.remove_seed(id, &target).unwrap();

        *target.pc.borrow_mut() = 0x4001;
        let outcome = ctrl.hit_dispatch(&target).unwrap();
        assert_eq!(outcome, HitOutcome::Unknown);
    }

    #[test]
    fn pending_symbol_seed_resolves_after_image_event() {
        let mut target = FakeTarget::new();
        let mut ctrl = Controller::new();

        let id = ctrl
            .add_symbol_seed("_late", Box::new(|_| Directives::BREAK), Some(&target))
            .unwrap();
        assert_eq!(ctrl.hold_count(0x5000), None);

        target.symbols.insert("_late", 0x5000);
        target.poke(0x5000, 0xCC);
        ctrl.try_resolve_all_pending(&target).unwrap();

        assert_eq!(ctrl.hold_count(0x5000), Some(1));
        assert!(!ctrl.pending_seeds.contains(&id));
    }

    #[test]
    fn step_over_disables_steps_and_reenables() {
        let target = FakeTarget::new();
        target.poke(0x6000, 0x55);
        let mut ctrl = Controller::new();
        ctrl.add_address_seed(0x6000, Box::new(|_| Directives::CONTINUE), Some(&target))
            .unwrap();
        assert_eq!(target.byte_at(0x6000), TRAP_OPCODE);

        *target.pc.borrow_mut() = 0x6000;
        ctrl.step_over_if_needed(&target).unwrap();

        assert_eq!(*target.pc.borrow(), 0x6001, "single-stepped past the patch");
        assert_eq!(target.byte_at(0x6000), TRAP_OPCODE, "re-enabled after the step");
    }

    #[test]
    fn detach_restores_patches_and_requeues_pending_seeds() {
        let target = FakeTarget::new();
        target.poke(0x7000, 0x55);
        let mut ctrl = Controller::new();
        ctrl.add_address_seed(0x7000, Box::new(|_| Directives::CONTINUE), Some(&target))
            .unwrap();

        ctrl.detach(Some(&target)).unwrap();

        assert_eq!(target.byte_at(0x7000), 0x55);
        assert_eq!(ctrl.pending_seeds.len(), 1, "seed requeued for the next run");
        assert!(ctrl.apoint_by_address.is_empty());
    }
}
