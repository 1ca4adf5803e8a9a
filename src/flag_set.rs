use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const BITS_PER_GROUP: usize = 64;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Group {
    bits: Arc<AtomicU64>,
    /// Side bitmap of which bits are currently allocated to a handle.
    /// Only ever touched from the bound thread.
    allocated: u64,
    callbacks: Vec<Option<Callback>>,
}

impl Group {
    fn new() -> Self {
        Group {
            bits: Arc::new(AtomicU64::new(0)),
            allocated: 0,
            callbacks: (0..BITS_PER_GROUP).map(|_| None).collect(),
        }
    }

    fn is_full(&self) -> bool {
        self.allocated == u64::MAX
    }

    fn is_empty(&self) -> bool {
        self.allocated == 0
    }
}

/// A lock-free "something just went non-empty" signal: any thread can flip a
/// bit, and the bound thread can cheaply swap a whole group of bits to zero
/// and run the callbacks paired with whichever bits were set.
///
/// Allocation, release, and iteration (`add_flag`/`release`/`run_active`) are
/// bound-thread-only operations and are guarded by a mutex over the group
/// list; flipping a bit (`set_active`) touches only that bit's own atomic
/// word and never takes the group-list lock, so it is safe and wait-free
/// from any thread racing against allocation/iteration on the bound thread.
pub struct AtomicFlagSet {
    groups: Arc<Mutex<Vec<Option<Group>>>>,
}

impl Default for AtomicFlagSet {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicFlagSet {
    pub fn new() -> Self {
        AtomicFlagSet {
            groups: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Allocates one bit, pairing it with `callback`. Bound thread only.
    pub fn add_flag(&self, callback: impl Fn() + Send + Sync + 'static) -> FlagHandle {
        let callback: Callback = Arc::new(callback);
        let mut groups = self.groups.lock();

        // First non-full existing group, else the first freed (`None`) slot,
        // else a brand new group at the end.
        let mut target = None;
        for (ix, slot) in groups.iter().enumerate() {
            if let Some(group) = slot {
                if !group.is_full() {
                    target = Some(ix);
                    break;
                }
            }
        }
        if target.is_none() {
            target = groups.iter().position(|slot| slot.is_none());
        }
        let group_ix = match target {
            Some(ix) => ix,
            None => {
                groups.push(None);
                groups.len() - 1
            }
        };
        if groups[group_ix].is_none() {
            groups[group_ix] = Some(Group::new());
        }

        let group = groups[group_ix].as_mut().unwrap();
        let bit = (0..BITS_PER_GROUP)
            .find(|b| group.allocated & (1 << b) == 0)
            .expect("target group was chosen because it has a free bit");
        group.allocated |= 1 << bit;
        group.callbacks[bit] = Some(callback);
        let bits = group.bits.clone();

        FlagHandle {
            groups: self.groups.clone(),
            group_ix,
            bit: bit as u32,
            bits,
        }
    }

    /// Runs the callback paired with every bit that is currently set, across
    /// every group, clearing each group's bits as it goes. Bound thread only.
    pub fn run_active(&self) {
        // Snapshot (swapped bits, callbacks) per group before invoking any
        // callback, so a callback re-entering this flag set (e.g. releasing
        // its own handle) cannot deadlock on the group-list lock.
        let snapshots: Vec<(u64, Vec<Option<Callback>>)> = {
            let groups = self.groups.lock();
            groups
                .iter()
                .filter_map(|slot| slot.as_ref())
                .map(|group| {
                    let active = group.bits.swap(0, Ordering::Acquire);
                    (active, group.callbacks.clone())
                })
                .collect()
        };

        for (active, callbacks) in snapshots {
            if active == 0 {
                continue;
            }
            for bit in 0..BITS_PER_GROUP {
                if active & (1 << bit) != 0 {
                    if let Some(callback) = &callbacks[bit] {
                        callback();
                    }
                }
            }
        }
    }
}

/// Owns exactly one bit of an [`AtomicFlagSet`].
pub struct FlagHandle {
    groups: Arc<Mutex<Vec<Option<Group>>>>,
    group_ix: usize,
    bit: u32,
    bits: Arc<AtomicU64>,
}

impl FlagHandle {
    /// Flips this handle's bit. Safe to call from any thread.
    pub fn set_active(&self, active: bool) {
        if active {
            self.bits.fetch_or(1 << self.bit, Ordering::Release);
        } else {
            self.bits.fetch_and(!(1 << self.bit), Ordering::Release);
        }
    }

    /// Deactivates the bit, clears its callback, and frees it for reuse.
    /// Bound thread only.
    pub fn release(&self) {
        self.set_active(false);
        let mut groups = self.groups.lock();
        if let Some(group) = groups[self.group_ix].as_mut() {
            group.allocated &= !(1 << self.bit);
            group.callbacks[self.bit as usize] = None;
            if group.is_empty() {
                groups[self.group_ix] = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn set_then_run_active_invokes_callback_once() {
        let set = AtomicFlagSet::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = {
            let count = count.clone();
            set.add_flag(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        handle.set_active(true);
        set.run_active();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Not set again: a second run_active is a no-op.
        set.run_active();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_frees_bit_for_reuse() {
        let set = AtomicFlagSet::new();
        let handles: Vec<_> = (0..BITS_PER_GROUP)
            .map(|_| set.add_flag(|| {}))
            .collect();
        // The group is now full; allocating another should open a new group.
        let extra = set.add_flag(|| {});
        assert_eq!(extra.group_ix, 1);

        handles[0].release();
        let reused = set.add_flag(|| {});
        assert_eq!(reused.group_ix, 0);
    }

    #[test]
    fn many_flags_each_run_independently() {
        let set = AtomicFlagSet::new();
        let counts: Vec<_> = (0..8).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let handles: Vec<_> = counts
            .iter()
            .map(|c| {
                let c = c.clone();
                set.add_flag(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        handles[2].set_active(true);
        handles[5].set_active(true);
        set.run_active();

        for (ix, c) in counts.iter().enumerate() {
            let expected = if ix == 2 || ix == 5 { 1 } else { 0 };
            assert_eq!(c.load(Ordering::SeqCst), expected, "flag {ix}");
        }
    }
}
