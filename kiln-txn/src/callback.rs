//! Callback lifecycle machinery.
//!
//! Every logical RPC wave of a transaction (init admission, fragment work,
//! prepare, finish, remote cleanup) is tracked by a [`CallbackSlot`]: armed
//! with the number of expected responses, fired on the first delivery,
//! finished when the counter drains or the wave is aborted. Slots live
//! inside the owning transaction state and transition under its mutex;
//! routing back to a transaction goes through the executor's table by
//! `(txn_id, partition)`, never through back-pointers.
//!
//! The redirect pair is the one standalone, pooled callback type: it is not
//! tied to a transaction state because it forwards a client request that
//! arrived at the wrong owner and relays the far-side response back.

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::{ClientHandle, PartitionId};
use kiln_common::pool::Reusable;
use kiln_core::response::ClientResponse;

/// Observable state of one callback wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackState {
    /// Not armed; safe to pool.
    Idle,
    /// Waiting for its first response.
    Armed,
    /// At least one response delivered, more outstanding.
    Fired,
    /// Terminal; safe to pool.
    Finished,
}

/// Result of delivering one response to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotProgress {
    /// Responses are still outstanding.
    Outstanding,
    /// This delivery was the last one; the slot is finished.
    Drained,
}

/// Counter-driven state machine for one RPC wave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackSlot {
    state: CallbackState,
    pending: usize,
}

impl Default for CallbackSlot {
    fn default() -> Self {
        Self {
            state: CallbackState::Idle,
            pending: 0,
        }
    }
}

impl CallbackSlot {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> CallbackState {
        self.state
    }

    /// Outstanding response count.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Returns whether the slot is terminal.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state == CallbackState::Finished
    }

    /// Arms the slot for `expected` responses.
    ///
    /// Arming with zero expected responses finishes immediately.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the slot is already armed or
    /// fired.
    pub fn arm(&mut self, expected: usize) -> KilnResult<()> {
        match self.state {
            CallbackState::Idle | CallbackState::Finished => {
                if expected == 0 {
                    self.state = CallbackState::Finished;
                    self.pending = 0;
                } else {
                    self.state = CallbackState::Armed;
                    self.pending = expected;
                }
                Ok(())
            }
            CallbackState::Armed | CallbackState::Fired => Err(KilnError::InvalidState(
                "callback slot is already armed",
            )),
        }
    }

    /// Records one response.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the slot was never armed or
    /// already drained.
    pub fn deliver(&mut self) -> KilnResult<SlotProgress> {
        match self.state {
            CallbackState::Armed | CallbackState::Fired => {
                self.pending = self.pending.saturating_sub(1);
                if self.pending == 0 {
                    self.state = CallbackState::Finished;
                    Ok(SlotProgress::Drained)
                } else {
                    self.state = CallbackState::Fired;
                    Ok(SlotProgress::Outstanding)
                }
            }
            CallbackState::Idle | CallbackState::Finished => Err(KilnError::InvalidState(
                "callback slot received a response it never expected",
            )),
        }
    }

    /// Terminates the wave regardless of outstanding responses.
    pub fn abort(&mut self) {
        self.state = CallbackState::Finished;
        self.pending = 0;
    }

    /// Returns the slot to idle for pooling.
    pub fn reset(&mut self) {
        self.state = CallbackState::Idle;
        self.pending = 0;
    }

    /// Returns whether the slot may be pooled (idle or terminal).
    #[must_use]
    pub fn is_poolable(&self) -> bool {
        matches!(self.state, CallbackState::Idle | CallbackState::Finished)
    }
}

/// Names of the per-transaction callback waves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// Local role: admission acks from every participating partition.
    /// Remote role: the queue-admission ack relayed to the base partition.
    Init,
    /// Fragment responses of the in-flight batch wave.
    Work,
    /// Ready-to-commit acks from participants.
    Prepare,
    /// Commit/abort acks from participants.
    Finish,
    /// Remote role: the final ack that releases the remote state.
    Cleanup,
}

/// The fixed callback-slot set carried by every transaction state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackSet {
    init: CallbackSlot,
    work: CallbackSlot,
    prepare: CallbackSlot,
    finish: CallbackSlot,
    cleanup: CallbackSlot,
}

impl CallbackSet {
    /// Borrows one slot by kind.
    #[must_use]
    pub fn slot(&self, kind: CallbackKind) -> &CallbackSlot {
        match kind {
            CallbackKind::Init => &self.init,
            CallbackKind::Work => &self.work,
            CallbackKind::Prepare => &self.prepare,
            CallbackKind::Finish => &self.finish,
            CallbackKind::Cleanup => &self.cleanup,
        }
    }

    /// Mutably borrows one slot by kind.
    pub fn slot_mut(&mut self, kind: CallbackKind) -> &mut CallbackSlot {
        match kind {
            CallbackKind::Init => &mut self.init,
            CallbackKind::Work => &mut self.work,
            CallbackKind::Prepare => &mut self.prepare,
            CallbackKind::Finish => &mut self.finish,
            CallbackKind::Cleanup => &mut self.cleanup,
        }
    }

    /// Finishes every slot, used when a transaction aborts early.
    pub fn abort_all(&mut self) {
        for kind in [
            CallbackKind::Init,
            CallbackKind::Work,
            CallbackKind::Prepare,
            CallbackKind::Finish,
            CallbackKind::Cleanup,
        ] {
            self.slot_mut(kind).abort();
        }
    }

    /// Returns every slot to idle for pooling.
    pub fn reset_all(&mut self) {
        for kind in [
            CallbackKind::Init,
            CallbackKind::Work,
            CallbackKind::Prepare,
            CallbackKind::Finish,
            CallbackKind::Cleanup,
        ] {
            self.slot_mut(kind).reset();
        }
    }

    /// Returns whether every slot may be pooled.
    #[must_use]
    pub fn all_poolable(&self) -> bool {
        [
            CallbackKind::Init,
            CallbackKind::Work,
            CallbackKind::Prepare,
            CallbackKind::Finish,
            CallbackKind::Cleanup,
        ]
        .into_iter()
        .all(|kind| self.slot(kind).is_poolable())
    }
}

/// Relay invoked with the far side's response to a forwarded request.
pub type RedirectRelay = Box<dyn FnOnce(ClientResponse) + Send>;

/// Pooled forward half of the redirect pair.
///
/// Armed when a client request arrives at a partition (or site) that does
/// not own the transaction's base partition: the request is forwarded to
/// the owner and this callback relays the owner's response back to the
/// originating connection.
pub struct RedirectCallback {
    client_handle: ClientHandle,
    origin_partition: PartitionId,
    relay: Option<RedirectRelay>,
}

impl std::fmt::Debug for RedirectCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectCallback")
            .field("client_handle", &self.client_handle)
            .field("origin_partition", &self.origin_partition)
            .field("armed", &self.relay.is_some())
            .finish()
    }
}

impl Default for RedirectCallback {
    fn default() -> Self {
        Self {
            client_handle: 0,
            origin_partition: 0,
            relay: None,
        }
    }
}

impl RedirectCallback {
    /// Arms the callback for one forwarded request.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the callback is still armed
    /// from a previous forward.
    pub fn arm(
        &mut self,
        client_handle: ClientHandle,
        origin_partition: PartitionId,
        relay: RedirectRelay,
    ) -> KilnResult<()> {
        if self.relay.is_some() {
            return Err(KilnError::InvalidState(
                "redirect callback is already armed",
            ));
        }
        self.client_handle = client_handle;
        self.origin_partition = origin_partition;
        self.relay = Some(relay);
        Ok(())
    }

    /// Client handle of the forwarded request.
    #[must_use]
    pub fn client_handle(&self) -> ClientHandle {
        self.client_handle
    }

    /// Partition the request originally entered through.
    #[must_use]
    pub fn origin_partition(&self) -> PartitionId {
        self.origin_partition
    }

    /// Relays the far side's response back to the originating connection.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the callback was never armed
    /// or already relayed.
    pub fn relay_response(&mut self, response: ClientResponse) -> KilnResult<()> {
        let Some(relay) = self.relay.take() else {
            return Err(KilnError::InvalidState(
                "redirect callback has no pending forward",
            ));
        };
        relay(response);
        Ok(())
    }
}

impl Reusable for RedirectCallback {
    fn reset(&mut self) {
        self.client_handle = 0;
        self.origin_partition = 0;
        self.relay = None;
    }

    fn is_idle(&self) -> bool {
        self.relay.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::{CallbackSet, CallbackSlot, CallbackState, RedirectCallback, SlotProgress};
    use googletest::prelude::*;
    use kiln_core::response::ClientResponse;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[rstest]
    fn slot_walks_armed_fired_finished() {
        let mut slot = CallbackSlot::default();
        slot.arm(2).expect("idle slot must arm");
        assert_that!(slot.state(), eq(CallbackState::Armed));

        assert_that!(
            slot.deliver().expect("armed slot accepts responses"),
            eq(SlotProgress::Outstanding)
        );
        assert_that!(slot.state(), eq(CallbackState::Fired));

        assert_that!(
            slot.deliver().expect("fired slot accepts responses"),
            eq(SlotProgress::Drained)
        );
        assert_that!(slot.is_finished(), eq(true));
    }

    #[rstest]
    fn arming_with_zero_expected_finishes_immediately() {
        let mut slot = CallbackSlot::default();
        slot.arm(0).expect("zero-armed slot must finish");
        assert_that!(slot.is_finished(), eq(true));
    }

    #[rstest]
    fn double_arm_is_rejected() {
        let mut slot = CallbackSlot::default();
        slot.arm(1).expect("idle slot must arm");
        assert_that!(slot.arm(1).is_err(), eq(true));
    }

    #[rstest]
    fn delivery_to_idle_slot_is_rejected() {
        let mut slot = CallbackSlot::default();
        assert_that!(slot.deliver().is_err(), eq(true));
    }

    #[rstest]
    fn abort_finishes_from_any_state() {
        let mut slot = CallbackSlot::default();
        slot.arm(3).expect("idle slot must arm");
        let _ = slot.deliver().expect("armed slot accepts responses");
        slot.abort();
        assert_that!(slot.is_finished(), eq(true));
        assert_that!(slot.pending(), eq(0_usize));
    }

    #[rstest]
    fn finished_slot_rearms_for_the_next_wave() {
        let mut slot = CallbackSlot::default();
        slot.arm(1).expect("idle slot must arm");
        let _ = slot.deliver().expect("armed slot accepts responses");
        slot.arm(1).expect("finished slot must rearm");
        assert_that!(slot.state(), eq(CallbackState::Armed));
    }

    #[rstest]
    fn callback_set_pools_only_when_every_slot_is_terminal() {
        let mut set = CallbackSet::default();
        assert_that!(set.all_poolable(), eq(true));

        set.slot_mut(super::CallbackKind::Prepare)
            .arm(2)
            .expect("idle slot must arm");
        assert_that!(set.all_poolable(), eq(false));

        set.abort_all();
        assert_that!(set.all_poolable(), eq(true));
    }

    #[rstest]
    fn redirect_relays_exactly_once() {
        let mut redirect = RedirectCallback::default();
        let relayed = Arc::new(AtomicBool::new(false));
        let observer = Arc::clone(&relayed);
        redirect
            .arm(9, 1, Box::new(move |_| observer.store(true, Ordering::Release)))
            .expect("idle redirect must arm");

        let response = ClientResponse::success(100, 9, Vec::new());
        redirect
            .relay_response(response.clone())
            .expect("armed redirect must relay");
        assert_that!(relayed.load(Ordering::Acquire), eq(true));
        assert_that!(redirect.relay_response(response).is_err(), eq(true));
    }
}
