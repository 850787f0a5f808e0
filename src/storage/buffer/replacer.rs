use std::fmt::Debug;

pub type FrameId = u32;

/// Victim-selection policy over the buffer pool's evictable frames.
///
/// The pool reports state changes to the policy: `unpin` when a frame's
/// pin count reaches zero, `pin` when an evictable frame is taken back
/// into use. `victim` hands one evictable frame over for reuse and
/// forgets it. The pool serializes every call under its own latch, so a
/// policy only needs to be `Send`.
pub trait Replacer: Send + Debug {
    /// Choose a victim among the evictable frames, removing it from the
    /// set. Returns `None` when nothing is evictable.
    fn victim(&mut self) -> Option<FrameId>;

    /// Withdraw a frame from the evictable set.
    fn pin(&mut self, frame_id: FrameId);

    /// Add a frame to the evictable set. Redundant unpins are ignored.
    fn unpin(&mut self, frame_id: FrameId);

    /// Number of evictable frames.
    fn size(&self) -> usize;
}
