//! Interface to the local mapping collaborator.
//!
//! Tracking commits keyframes to the shared map itself and then notifies the
//! mapper through this interface. The mapper runs on its own thread and owns
//! triangulation, culling and local BA; none of that lives in this crate.
//!
//! Flow control works in both directions: the mapper parks the `accepting`
//! flag when its queue grows, and tracking asks for BA interruption when a
//! keyframe decision cannot wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::warn;

use crate::map::KeyFrameId;

/// The slice of the local mapper that tracking consumes.
pub trait LocalMapping: Send + Sync {
    /// Enqueue a freshly committed keyframe. Non-blocking: returns `false`
    /// when the mapper queue is full, in which case tracking simply skips
    /// keyframe creation for this frame.
    fn insert_keyframe(&self, kf_id: KeyFrameId) -> bool;

    /// Whether the mapper is idle enough to take a keyframe.
    fn accept_keyframes(&self) -> bool;

    /// Ask the mapper not to pause while a keyframe insertion is pending.
    /// Returns `false` if the mapper is already stopped.
    fn set_not_stop(&self, flag: bool) -> bool;

    /// Ask the mapper to abort the local BA in progress.
    fn interrupt_ba(&self);

    /// Part of the cooperative reset: instructs the mapper to flush its
    /// queue and discard in-flight work.
    fn request_reset(&self);
}

/// Channel-backed mapper handle: tracking side of a bounded keyframe queue.
pub struct QueuedLocalMapper {
    sender: Sender<KeyFrameId>,
    accepting: AtomicBool,
    stopped: AtomicBool,
    not_stop: AtomicBool,
    interrupt_ba: AtomicBool,
    reset_requested: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl QueuedLocalMapper {
    /// Create the handle plus the receiving end for the mapper thread.
    pub fn new(queue_capacity: usize) -> (Arc<Self>, Receiver<KeyFrameId>) {
        let (sender, receiver) = bounded(queue_capacity);
        (
            Arc::new(Self {
                sender,
                accepting: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                not_stop: AtomicBool::new(false),
                interrupt_ba: AtomicBool::new(false),
                reset_requested: AtomicBool::new(false),
                shutdown_requested: AtomicBool::new(false),
            }),
            receiver,
        )
    }

    // ── Mapper-side controls ────────────────────────────────────────────

    pub fn set_accept_keyframes(&self, flag: bool) {
        self.accepting.store(flag, Ordering::SeqCst);
    }

    pub fn set_stopped(&self, flag: bool) {
        self.stopped.store(flag, Ordering::SeqCst);
    }

    pub fn take_interrupt_ba(&self) -> bool {
        self.interrupt_ba.swap(false, Ordering::SeqCst)
    }

    pub fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }

    /// Ask the mapper thread to finish; checked at the top of its loop.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

impl LocalMapping for QueuedLocalMapper {
    fn insert_keyframe(&self, kf_id: KeyFrameId) -> bool {
        match self.sender.try_send(kf_id) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(kf = %kf_id, "mapper queue full, keyframe not enqueued");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("mapper queue disconnected");
                false
            }
        }
    }

    fn accept_keyframes(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn set_not_stop(&self, flag: bool) -> bool {
        if flag && self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        self.not_stop.store(flag, Ordering::SeqCst);
        true
    }

    fn interrupt_ba(&self) {
        self.interrupt_ba.store(true, Ordering::SeqCst);
    }

    fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_bounded_and_non_blocking() {
        let (mapper, receiver) = QueuedLocalMapper::new(2);
        assert!(mapper.insert_keyframe(KeyFrameId(0)));
        assert!(mapper.insert_keyframe(KeyFrameId(1)));
        // Full queue: the call must not block, just report failure.
        assert!(!mapper.insert_keyframe(KeyFrameId(2)));

        assert_eq!(receiver.recv().unwrap(), KeyFrameId(0));
        assert!(mapper.insert_keyframe(KeyFrameId(2)));
    }

    #[test]
    fn test_accept_flag_roundtrip() {
        let (mapper, _receiver) = QueuedLocalMapper::new(1);
        assert!(mapper.accept_keyframes());
        mapper.set_accept_keyframes(false);
        assert!(!mapper.accept_keyframes());
    }

    #[test]
    fn test_set_not_stop_fails_when_stopped() {
        let (mapper, _receiver) = QueuedLocalMapper::new(1);
        assert!(mapper.set_not_stop(true));
        mapper.set_stopped(true);
        assert!(!mapper.set_not_stop(true));
    }

    #[test]
    fn test_interrupt_and_reset_flags_are_one_shot() {
        let (mapper, _receiver) = QueuedLocalMapper::new(1);
        mapper.interrupt_ba();
        assert!(mapper.take_interrupt_ba());
        assert!(!mapper.take_interrupt_ba());

        mapper.request_reset();
        assert!(mapper.take_reset_request());
        assert!(!mapper.take_reset_request());
    }
}
