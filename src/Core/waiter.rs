// Consumer waiter status: the lock-free state machine that decides which
// thread, if any, is driving delivery to the single consumer of a queue.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bitflags::bitflags;

use super::error::QueueError;

/// Primary waiter state. Exactly one is current at any time.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaiterState {
    /// No consumer attached.
    Disconnected = 0,
    /// Consumer attached but not pulling.
    Disabled = 1,
    /// Idle and ready to be locked by a delivering thread.
    Enabled = 2,
    /// Locked by a thread searching for a deliverable message.
    Getting = 3,
    /// Locked by a thread inside the consumer callback. That thread will
    /// re-check for messages after it unlocks.
    Delivering = 4,
    /// Locked while disabled so the queue structure can be operated on.
    /// Enable, disable and disconnect wait for it to clear.
    DisabledLockedWait = 5,
}

impl WaiterState {
    fn from_bits(bits: u32) -> Self {
        match bits & STATE_MASK {
            0 => WaiterState::Disconnected,
            1 => WaiterState::Disabled,
            2 => WaiterState::Enabled,
            3 => WaiterState::Getting,
            4 => WaiterState::Delivering,
            5 => WaiterState::DisabledLockedWait,
            other => crate::breach!("corrupt waiter status word", bits = other),
        }
    }

    pub fn is_locked(self) -> bool {
        matches!(
            self,
            WaiterState::Getting | WaiterState::Delivering | WaiterState::DisabledLockedWait
        )
    }

    /// Locked by a delivering thread; the only states pending flags may be added to.
    fn is_delivery_locked(self) -> bool {
        matches!(self, WaiterState::Getting | WaiterState::Delivering)
    }
}

const STATE_MASK: u32 = 0xff;

bitflags! {
    /// Requests left for the current lock holder to act on before it unlocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PendingFlags: u32 {
        const DISABLE        = 1 << 8;
        const CANCEL_DISABLE = 1 << 9;
        const DISCONNECT     = 1 << 10;
        const RECLAIM_SPACE  = 1 << 11;
    }
}

/// A decoded view of the waiter status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterSnapshot {
    pub state: WaiterState,
    pub pending: PendingFlags,
}

impl WaiterSnapshot {
    pub const fn new(state: WaiterState) -> Self {
        Self {
            state,
            pending: PendingFlags::empty(),
        }
    }

    const fn with(state: WaiterState, pending: PendingFlags) -> Self {
        Self { state, pending }
    }

    fn encode(self) -> u32 {
        self.state as u32 | self.pending.bits()
    }

    fn decode(word: u32) -> Self {
        Self {
            state: WaiterState::from_bits(word),
            pending: PendingFlags::from_bits_truncate(word & !STATE_MASK),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// What an enable request achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableOutcome {
    /// Moved from disabled to enabled.
    Enabled,
    /// A disable had been requested but not yet acted upon; it is cancelled.
    DisableCancelled,
}

/// What a disable request achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableOutcome {
    /// The caller now holds the lock with disable pending and must complete it.
    Locked { was_enabled: bool },
    /// Another thread holds the lock and will complete the disable.
    Pending,
    AlreadyDisabled,
    Invalid,
}

/// What a disconnect request achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The caller now holds the lock with disconnect pending and must complete it.
    Locked { was_enabled: bool },
    /// Another thread holds the lock and will complete the disconnect.
    Pending,
    Invalid,
}

/// A lock taken for a queue-structure operation (reclaim, expiry, drain, dump).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLock {
    /// The status the waiter had before we locked it; restored on unlock.
    pub pre: WaiterSnapshot,
    /// The locked state we moved it into.
    pub held: WaiterState,
}

/// Outcome of trying to lock the waiter for space reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimLock {
    Locked(QueueLock),
    /// The waiter was busy; a reclaim-space flag was left for the holder.
    FlagLeft,
}

/// Coarse delivery status as reported to protocol layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Started,
    Stopping,
    Stopped,
}

const ENABLED: WaiterSnapshot = WaiterSnapshot::new(WaiterState::Enabled);

/// The waiter status of a queue's single consumer.
///
/// All transitions are compare-and-swap on one word; nothing here blocks
/// except the short spins while another thread holds `DisabledLockedWait`.
/// Pending flags ride alongside a delivery-locked state so that an unlock
/// which would drop them fails instead.
pub struct WaiterStatus {
    word: AtomicU32,
}

impl Default for WaiterStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl WaiterStatus {
    pub fn new() -> Self {
        Self {
            word: AtomicU32::new(WaiterSnapshot::new(WaiterState::Disconnected).encode()),
        }
    }

    pub fn load(&self) -> WaiterSnapshot {
        WaiterSnapshot::decode(self.word.load(Ordering::Acquire))
    }

    pub(crate) fn transition(
        &self,
        from: WaiterSnapshot,
        to: WaiterSnapshot,
    ) -> Result<(), WaiterSnapshot> {
        self.word
            .compare_exchange(from.encode(), to.encode(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(WaiterSnapshot::decode)
    }

    /// `Enabled -> Getting|Delivering`. On failure returns the observed status.
    pub fn try_lock(&self, to: WaiterState) -> Result<(), WaiterSnapshot> {
        debug_assert!(to.is_delivery_locked());
        self.transition(ENABLED, WaiterSnapshot::new(to))
    }

    /// `Getting -> Delivering`, keeping any pending flags.
    pub fn promote_to_delivering(&self) {
        loop {
            let current = self.load();
            if current.state != WaiterState::Getting {
                crate::breach!("promote to delivering from wrong state", status = current);
            }
            let next = WaiterSnapshot::with(WaiterState::Delivering, current.pending);
            if self.transition(current, next).is_ok() {
                return;
            }
        }
    }

    /// Unlock from `from` to `to`, failing if any pending flag arrived while
    /// the lock was held. The caller must then complete the pending actions.
    pub fn try_unlock_no_pending(&self, from: WaiterState, to: WaiterSnapshot) -> bool {
        debug_assert!(from.is_locked());
        debug_assert!(!to.state.is_locked());
        match self.transition(WaiterSnapshot::new(from), to) {
            Ok(()) => true,
            Err(actual) if actual.state == from && actual.has_pending() => false,
            Err(actual) => crate::breach!(
                "unlock of waiter not held in expected state",
                expected = from,
                status = actual
            ),
        }
    }

    /// Leave a request for the current holder. Only legal while delivery-locked.
    pub fn add_pending_while_locked(&self, flag: PendingFlags) {
        loop {
            let current = self.load();
            if !current.state.is_delivery_locked() {
                crate::breach!("pending flag added to unlocked waiter", status = current, flag = flag);
            }
            let next = WaiterSnapshot::with(current.state, current.pending | flag);
            if self.transition(current, next).is_ok() {
                return;
            }
        }
    }

    /// Remove a single pending flag the holder is about to act on.
    pub(crate) fn take_pending(&self, current: WaiterSnapshot, flag: PendingFlags) -> bool {
        let next = WaiterSnapshot::with(current.state, current.pending - flag);
        self.transition(current, next).is_ok()
    }

    /// `Disconnected -> Disabled` for a newly attached consumer.
    pub fn connect(&self) -> Result<(), QueueError> {
        loop {
            let current = self.load();
            match current.state {
                WaiterState::DisabledLockedWait => std::hint::spin_loop(),
                WaiterState::Disconnected => {
                    if self
                        .transition(current, WaiterSnapshot::new(WaiterState::Disabled))
                        .is_ok()
                    {
                        return Ok(());
                    }
                }
                _ => return Err(QueueError::WaiterInUse),
            }
        }
    }

    pub fn enable(&self) -> Result<EnableOutcome, QueueError> {
        loop {
            let current = self.load();
            if current.pending.contains(PendingFlags::DISCONNECT) {
                return Err(QueueError::WaiterInvalid);
            }
            match current.state {
                WaiterState::Disconnected => return Err(QueueError::WaiterInvalid),
                WaiterState::DisabledLockedWait => std::hint::spin_loop(),
                WaiterState::Disabled => {
                    if self.transition(current, ENABLED).is_ok() {
                        return Ok(EnableOutcome::Enabled);
                    }
                }
                WaiterState::Enabled | WaiterState::Getting | WaiterState::Delivering => {
                    if current.pending.contains(PendingFlags::CANCEL_DISABLE)
                        || !current.pending.contains(PendingFlags::DISABLE)
                    {
                        return Err(QueueError::WaiterEnabled);
                    }
                    let next = WaiterSnapshot::with(
                        current.state,
                        current.pending | PendingFlags::CANCEL_DISABLE,
                    );
                    if self.transition(current, next).is_ok() {
                        return Ok(EnableOutcome::DisableCancelled);
                    }
                }
            }
        }
    }

    pub fn disable(&self) -> DisableOutcome {
        loop {
            let current = self.load();
            if current.pending.contains(PendingFlags::DISCONNECT) {
                return DisableOutcome::Invalid;
            }
            match current.state {
                WaiterState::Disconnected => return DisableOutcome::Invalid,
                WaiterState::Disabled => return DisableOutcome::AlreadyDisabled,
                WaiterState::DisabledLockedWait => std::hint::spin_loop(),
                WaiterState::Enabled => {
                    let next = WaiterSnapshot::with(WaiterState::Getting, PendingFlags::DISABLE);
                    if self.transition(current, next).is_ok() {
                        return DisableOutcome::Locked { was_enabled: true };
                    }
                }
                WaiterState::Getting | WaiterState::Delivering => {
                    let pending = if current.pending.contains(PendingFlags::CANCEL_DISABLE) {
                        // disabled, enabled and disabled again while locked
                        current.pending - PendingFlags::CANCEL_DISABLE
                    } else {
                        current.pending | PendingFlags::DISABLE
                    };
                    if pending == current.pending
                        || self
                            .transition(current, WaiterSnapshot::with(current.state, pending))
                            .is_ok()
                    {
                        return DisableOutcome::Pending;
                    }
                }
            }
        }
    }

    pub fn request_disconnect(&self) -> DisconnectOutcome {
        loop {
            let current = self.load();
            if current.pending.contains(PendingFlags::DISCONNECT) {
                return DisconnectOutcome::Invalid;
            }
            match current.state {
                WaiterState::Disconnected => return DisconnectOutcome::Invalid,
                WaiterState::DisabledLockedWait => std::hint::spin_loop(),
                WaiterState::Enabled | WaiterState::Disabled => {
                    let next = WaiterSnapshot::with(WaiterState::Getting, PendingFlags::DISCONNECT);
                    if self.transition(current, next).is_ok() {
                        return DisconnectOutcome::Locked {
                            was_enabled: current.state == WaiterState::Enabled,
                        };
                    }
                }
                WaiterState::Getting | WaiterState::Delivering => {
                    let pending = (current.pending - PendingFlags::CANCEL_DISABLE)
                        | PendingFlags::DISCONNECT;
                    if self
                        .transition(current, WaiterSnapshot::with(current.state, pending))
                        .is_ok()
                    {
                        return DisconnectOutcome::Pending;
                    }
                }
            }
        }
    }

    pub fn lock_for_reclaim(&self) -> ReclaimLock {
        loop {
            let current = self.load();
            match current.state {
                WaiterState::Enabled => {
                    if let Some(lock) = self.lock_to(current, WaiterState::Delivering) {
                        return ReclaimLock::Locked(lock);
                    }
                }
                WaiterState::Disabled | WaiterState::Disconnected => {
                    if let Some(lock) = self.lock_to(current, WaiterState::DisabledLockedWait) {
                        return ReclaimLock::Locked(lock);
                    }
                }
                WaiterState::Getting | WaiterState::Delivering => {
                    let next = WaiterSnapshot::with(
                        current.state,
                        current.pending | PendingFlags::RECLAIM_SPACE,
                    );
                    if self.transition(current, next).is_ok() {
                        return ReclaimLock::FlagLeft;
                    }
                }
                WaiterState::DisabledLockedWait => std::hint::spin_loop(),
            }
        }
    }

    /// Try once to lock the waiter for a queue operation.
    ///
    /// With `allow_delivery` an enabled waiter is locked as `Delivering`, so the
    /// unlock will re-run delivery. Without it only a disabled or disconnected
    /// waiter can be locked.
    pub fn try_lock_for_operation(&self, allow_delivery: bool) -> Option<QueueLock> {
        loop {
            let current = self.load();
            match current.state {
                WaiterState::Enabled if allow_delivery => {
                    if let Some(lock) = self.lock_to(current, WaiterState::Delivering) {
                        return Some(lock);
                    }
                }
                WaiterState::Disabled | WaiterState::Disconnected => {
                    if let Some(lock) = self.lock_to(current, WaiterState::DisabledLockedWait) {
                        return Some(lock);
                    }
                }
                WaiterState::DisabledLockedWait if allow_delivery => std::hint::spin_loop(),
                _ => return None,
            }
        }
    }

    /// Keep trying to lock for a queue operation for up to `wait`.
    pub fn lock_for_operation_within(&self, allow_delivery: bool, wait: Duration) -> Option<QueueLock> {
        let start = Instant::now();
        loop {
            if let Some(lock) = self.try_lock_for_operation(allow_delivery) {
                return Some(lock);
            }
            if start.elapsed() >= wait {
                return None;
            }
            std::thread::yield_now();
        }
    }

    /// Release a `DisabledLockedWait` lock. Nobody may add flags to that
    /// state, so failure is a breach.
    pub fn unlock_locked_wait(&self, lock: QueueLock) {
        debug_assert_eq!(lock.held, WaiterState::DisabledLockedWait);
        if let Err(actual) = self.transition(WaiterSnapshot::new(lock.held), lock.pre) {
            crate::breach!("waiter changed while locked for queue operation", status = actual);
        }
    }

    fn lock_to(&self, current: WaiterSnapshot, held: WaiterState) -> Option<QueueLock> {
        self.transition(current, WaiterSnapshot::new(held))
            .ok()
            .map(|()| QueueLock { pre: current, held })
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        let current = self.load();
        match current.state {
            WaiterState::Disconnected | WaiterState::Disabled | WaiterState::DisabledLockedWait => {
                DeliveryStatus::Stopped
            }
            _ if current
                .pending
                .intersects(PendingFlags::DISABLE | PendingFlags::DISCONNECT)
                && !current.pending.contains(PendingFlags::CANCEL_DISABLE) =>
            {
                DeliveryStatus::Stopping
            }
            _ => DeliveryStatus::Started,
        }
    }
}

impl std::fmt::Debug for WaiterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.load();
        f.debug_struct("WaiterStatus")
            .field("state", &snapshot.state)
            .field("pending", &snapshot.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> WaiterStatus {
        let waiter = WaiterStatus::new();
        waiter.connect().unwrap();
        waiter.enable().unwrap();
        waiter
    }

    #[test]
    fn connect_only_from_disconnected() {
        let waiter = WaiterStatus::new();
        assert!(waiter.connect().is_ok());
        assert_eq!(waiter.connect(), Err(QueueError::WaiterInUse));
        assert_eq!(waiter.load().state, WaiterState::Disabled);
    }

    #[test]
    fn only_enabled_can_be_locked_for_delivery() {
        let waiter = WaiterStatus::new();
        waiter.connect().unwrap();
        assert!(waiter.try_lock(WaiterState::Getting).is_err());
        waiter.enable().unwrap();
        assert!(waiter.try_lock(WaiterState::Getting).is_ok());
        let observed = waiter.try_lock(WaiterState::Getting).unwrap_err();
        assert_eq!(observed.state, WaiterState::Getting);
    }

    #[test]
    fn unlock_fails_when_flag_left() {
        let waiter = enabled();
        waiter.try_lock(WaiterState::Getting).unwrap();
        assert_eq!(waiter.disable(), DisableOutcome::Pending);
        assert!(!waiter.try_unlock_no_pending(WaiterState::Getting, ENABLED));
        let snapshot = waiter.load();
        assert_eq!(snapshot.state, WaiterState::Getting);
        assert!(snapshot.pending.contains(PendingFlags::DISABLE));
    }

    #[test]
    fn promote_keeps_pending_flags() {
        let waiter = enabled();
        waiter.try_lock(WaiterState::Getting).unwrap();
        waiter.add_pending_while_locked(PendingFlags::RECLAIM_SPACE);
        waiter.promote_to_delivering();
        let snapshot = waiter.load();
        assert_eq!(snapshot.state, WaiterState::Delivering);
        assert_eq!(snapshot.pending, PendingFlags::RECLAIM_SPACE);
    }

    #[test]
    fn enable_cancels_pending_disable() {
        let waiter = enabled();
        waiter.try_lock(WaiterState::Delivering).unwrap();
        assert_eq!(waiter.disable(), DisableOutcome::Pending);
        assert_eq!(waiter.delivery_status(), DeliveryStatus::Stopping);
        assert_eq!(waiter.enable(), Ok(EnableOutcome::DisableCancelled));
        assert_eq!(waiter.enable(), Err(QueueError::WaiterEnabled));
        assert_eq!(waiter.delivery_status(), DeliveryStatus::Started);
        // disabling again drops the cancel
        assert_eq!(waiter.disable(), DisableOutcome::Pending);
        assert_eq!(waiter.load().pending, PendingFlags::DISABLE);
    }

    #[test]
    fn disable_of_idle_waiter_takes_lock() {
        let waiter = enabled();
        assert_eq!(waiter.disable(), DisableOutcome::Locked { was_enabled: true });
        let snapshot = waiter.load();
        assert!(snapshot.state.is_locked());
        assert_eq!(snapshot.pending, PendingFlags::DISABLE);
    }

    #[test]
    fn disconnect_requests() {
        let waiter = WaiterStatus::new();
        assert_eq!(waiter.request_disconnect(), DisconnectOutcome::Invalid);
        waiter.connect().unwrap();
        assert_eq!(
            waiter.request_disconnect(),
            DisconnectOutcome::Locked { was_enabled: false }
        );
        assert_eq!(waiter.request_disconnect(), DisconnectOutcome::Invalid);
        assert_eq!(waiter.enable(), Err(QueueError::WaiterInvalid));
    }

    #[test]
    fn reclaim_lock_leaves_flag_when_busy() {
        let waiter = enabled();
        waiter.try_lock(WaiterState::Getting).unwrap();
        assert_eq!(waiter.lock_for_reclaim(), ReclaimLock::FlagLeft);
        assert_eq!(waiter.load().pending, PendingFlags::RECLAIM_SPACE);
    }

    #[test]
    fn operation_lock_on_disabled_waiter() {
        let waiter = WaiterStatus::new();
        waiter.connect().unwrap();
        let lock = waiter.try_lock_for_operation(false).unwrap();
        assert_eq!(lock.held, WaiterState::DisabledLockedWait);
        assert_eq!(waiter.delivery_status(), DeliveryStatus::Stopped);
        waiter.unlock_locked_wait(lock);
        assert_eq!(waiter.load().state, WaiterState::Disabled);
    }

    #[test]
    fn operation_lock_without_delivery_refuses_enabled() {
        let waiter = enabled();
        assert!(waiter.try_lock_for_operation(false).is_none());
        let lock = waiter.try_lock_for_operation(true).unwrap();
        assert_eq!(lock.held, WaiterState::Delivering);
        assert!(waiter.try_unlock_no_pending(lock.held, lock.pre));
    }
}
