//! Stripe layout of a logical object
//!
//! Responsibilities:
//! - Record, for one logical object, which target holds each stripe and
//!   under which sub-object id.
//! - Map logical byte offsets and ranges onto stripe-local ones (RAID-0 style
//!   round robin over `stripe_size`-byte units).
//! - Keep the per-stripe async error slot, the only mutable part of a layout.
//!
//! Submodules:
//! - `split`: split a logical range into per-stripe spans for the I/O path

pub mod split;

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::{Result, VolumeError};
use crate::types::OBJECT_EOF;

pub use split::StripeSpan;

pub const LAYOUT_MAGIC: u32 = 0x0BD1_0BD0;

/// One stripe of a logical object.
#[derive(Debug)]
pub struct StripeInfo {
    pub target_idx: usize,
    pub sub_id: u64,
    async_rc: Mutex<Option<VolumeError>>,
}

impl StripeInfo {
    pub fn new(target_idx: usize, sub_id: u64) -> Self {
        Self {
            target_idx,
            sub_id,
            async_rc: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<VolumeError>> {
        self.async_rc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn async_rc(&self) -> Option<VolumeError> {
        self.slot().clone()
    }

    /// Keeps the first error until it is collected.
    pub(crate) fn record_error(&self, err: &VolumeError) {
        let mut slot = self.slot();
        if slot.is_none() {
            *slot = Some(err.clone());
        }
    }

    pub(crate) fn clear_error(&self) -> Option<VolumeError> {
        self.slot().take()
    }
}

#[derive(Debug)]
pub struct StripeLayout {
    magic: u32,
    object_id: u64,
    stripe_size: u64,
    stripes: Vec<StripeInfo>,
}

/// Caller-facing description of a layout (what `GetStripe` hands out).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutView {
    pub object_id: u64,
    pub stripe_size: u64,
    pub stripe_count: usize,
    pub stripes: Vec<(usize, u64)>,
}

impl StripeLayout {
    /// Builds a layout from `(target_idx, sub_id)` pairs in stripe order.
    pub fn new(object_id: u64, stripe_size: u64, stripes: Vec<StripeInfo>) -> Result<Self> {
        if stripes.is_empty() {
            return Err(VolumeError::invalid("layout needs at least one stripe"));
        }
        if stripe_size == 0 {
            return Err(VolumeError::invalid("stripe size must be non-zero"));
        }
        check_stripe_width(stripe_size, stripes.len() as u64)?;
        Ok(Self {
            magic: LAYOUT_MAGIC,
            object_id,
            stripe_size,
            stripes,
        })
    }

    pub fn from_targets(
        object_id: u64,
        stripe_size: u64,
        stripes: impl IntoIterator<Item = (usize, u64)>,
    ) -> Result<Self> {
        let stripes = stripes
            .into_iter()
            .map(|(idx, sub_id)| StripeInfo::new(idx, sub_id))
            .collect();
        Self::new(object_id, stripe_size, stripes)
    }

    pub fn check_magic(&self) -> Result<()> {
        if self.magic != LAYOUT_MAGIC {
            return Err(VolumeError::invalid(format!(
                "bad layout magic {:#x}",
                self.magic
            )));
        }
        Ok(())
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn stripe_size(&self) -> u64 {
        self.stripe_size
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub fn stripes(&self) -> &[StripeInfo] {
        &self.stripes
    }

    pub fn stripe(&self, stripe: usize) -> Option<&StripeInfo> {
        self.stripes.get(stripe)
    }

    /// Bytes covered by one full round of stripes.
    pub fn stripe_width(&self) -> u64 {
        self.stripe_size * self.stripes.len() as u64
    }

    /// Stripe that holds logical byte `offset`.
    pub fn stripe_of(&self, offset: u64) -> usize {
        ((offset % self.stripe_width()) / self.stripe_size) as usize
    }

    /// Number of bytes of `stripe` that precede logical `offset`.
    ///
    /// For an offset inside the stripe this is its stripe-local offset; an
    /// offset in another stripe is clamped to the nearest boundary of this
    /// one. `OBJECT_EOF` maps to itself.
    pub fn stripe_offset(&self, stripe: usize, offset: u64) -> u64 {
        if offset == OBJECT_EOF {
            return OBJECT_EOF;
        }
        let width = self.stripe_width();
        let round = offset / width;
        let within = offset % width;
        let this_stripe = stripe as u64 * self.stripe_size;
        let local = if within < this_stripe {
            0
        } else {
            (within - this_stripe).min(self.stripe_size)
        };
        round * self.stripe_size + local
    }

    /// Stripe-local part of the logical range `[start, end)`, or `None` when
    /// the range never touches `stripe`.
    pub fn intersecting_range(&self, stripe: usize, start: u64, end: u64) -> Option<(u64, u64)> {
        if start >= end || stripe >= self.stripes.len() {
            return None;
        }
        let local_start = self.stripe_offset(stripe, start);
        let local_end = self.stripe_offset(stripe, end);
        (local_start < local_end).then_some((local_start, local_end))
    }

    /// Logical size implied by `stripe` holding `local_size` bytes.
    pub fn stripe_size_to_object(&self, stripe: usize, local_size: u64) -> u64 {
        if local_size == 0 {
            return 0;
        }
        let ssize = self.stripe_size;
        let width = self.stripe_width();
        let rounds = local_size / ssize;
        let tail = local_size % ssize;
        let size = if tail != 0 {
            rounds
                .checked_mul(width)
                .and_then(|v| v.checked_add(stripe as u64 * ssize + tail))
        } else {
            (rounds - 1)
                .checked_mul(width)
                .and_then(|v| v.checked_add((stripe as u64 + 1) * ssize))
        };
        size.unwrap_or(OBJECT_EOF)
    }

    /// Size of the sub-object of `stripe` when the logical object is
    /// `object_size` bytes long.
    pub fn size_to_stripe(&self, stripe: usize, object_size: u64) -> u64 {
        self.stripe_offset(stripe, object_size)
    }

    pub fn stripe_for_target(&self, target_idx: usize) -> Option<usize> {
        self.stripes.iter().position(|s| s.target_idx == target_idx)
    }

    /// First recorded async error across all stripes; clears every slot.
    pub fn test_and_clear_async_rc(&self) -> Result<()> {
        let mut rc = Ok(());
        for stripe in &self.stripes {
            if let Some(err) = stripe.clear_error() {
                if rc.is_ok() {
                    rc = Err(err);
                }
            }
        }
        rc
    }

    pub fn view(&self) -> LayoutView {
        LayoutView {
            object_id: self.object_id,
            stripe_size: self.stripe_size,
            stripe_count: self.stripes.len(),
            stripes: self
                .stripes
                .iter()
                .map(|s| (s.target_idx, s.sub_id))
                .collect(),
        }
    }
}

/// `count * size` has to be addressable on this platform.
pub fn check_stripe_width(stripe_size: u64, stripe_count: u64) -> Result<u64> {
    match stripe_size.checked_mul(stripe_count) {
        Some(width) if width <= usize::MAX as u64 => Ok(width),
        _ => Err(VolumeError::invalid(format!(
            "stripe width {stripe_size}x{stripe_count} exceeds {}",
            usize::MAX
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SS: u64 = 65536;

    fn layout(count: usize) -> StripeLayout {
        StripeLayout::from_targets(0x10, SS, (0..count).map(|i| (i, 100 + i as u64))).unwrap()
    }

    #[test]
    fn test_stripe_of_round_robin() {
        let l = layout(3);
        for block in 0..12u64 {
            let off = block * SS;
            assert_eq!(l.stripe_of(off), (block % 3) as usize);
            assert_eq!(l.stripe_of(off + SS - 1), (block % 3) as usize);
            // stable across calls
            assert_eq!(l.stripe_of(off), l.stripe_of(off));
        }
    }

    #[test]
    fn test_stripe_offset_inside_stripe() {
        let l = layout(2);
        // second round, stripe 1, 10 bytes in
        let off = 2 * SS + SS + 10;
        assert_eq!(l.stripe_of(off), 1);
        assert_eq!(l.stripe_offset(1, off), SS + 10);
        assert_eq!(l.stripe_offset(0, OBJECT_EOF), OBJECT_EOF);
    }

    #[test]
    fn test_intersecting_range_skips_untouched_stripe() {
        let l = layout(2);
        assert_eq!(l.intersecting_range(0, 0, SS), Some((0, SS)));
        assert_eq!(l.intersecting_range(1, 0, SS), None);
        // [1.5 SS, 2.5 SS) touches the tail of stripe 1 and the head of the
        // second round of stripe 0
        let (s, e) = (SS + SS / 2, 2 * SS + SS / 2);
        assert_eq!(l.intersecting_range(1, s, e), Some((SS / 2, SS)));
        assert_eq!(l.intersecting_range(0, s, e), Some((SS, SS + SS / 2)));
        assert_eq!(l.intersecting_range(0, 5, 5), None);
    }

    #[test]
    fn test_intersecting_range_to_eof() {
        let l = layout(4);
        for stripe in 0..4 {
            let r = l.intersecting_range(stripe, 3 * SS, OBJECT_EOF).unwrap();
            assert_eq!(r.1, OBJECT_EOF);
        }
        assert_eq!(l.intersecting_range(0, 3 * SS, OBJECT_EOF), Some((SS, OBJECT_EOF)));
        assert_eq!(l.intersecting_range(3, 3 * SS, OBJECT_EOF), Some((0, OBJECT_EOF)));
    }

    #[test]
    fn test_size_mapping_both_ways() {
        let l = layout(3);
        // object of 2.5 stripes: stripe 0 full, stripe 1 full, stripe 2 half
        let size = 2 * SS + SS / 2;
        assert_eq!(l.size_to_stripe(0, size), SS);
        assert_eq!(l.size_to_stripe(1, size), SS);
        assert_eq!(l.size_to_stripe(2, size), SS / 2);
        assert_eq!(l.stripe_size_to_object(2, SS / 2), size);
        assert_eq!(l.stripe_size_to_object(0, SS), SS);
        assert_eq!(l.stripe_size_to_object(1, 0), 0);
    }

    #[test]
    fn test_async_rc_first_error_then_cleared() {
        let l = layout(3);
        l.stripes()[2].record_error(&VolumeError::NoSpace);
        l.stripes()[1].record_error(&VolumeError::TimedOut);
        l.stripes()[1].record_error(&VolumeError::NoSpace);
        assert_eq!(l.stripes()[1].async_rc(), Some(VolumeError::TimedOut));
        assert_eq!(l.test_and_clear_async_rc(), Err(VolumeError::TimedOut));
        assert_eq!(l.test_and_clear_async_rc(), Ok(()));
    }

    #[test]
    fn test_width_overflow_rejected() {
        assert!(check_stripe_width(u64::MAX / 2, 3).is_err());
        assert!(StripeLayout::from_targets(1, 0, [(0, 1)]).is_err());
        assert!(StripeLayout::from_targets(1, SS, []).is_err());
    }
}
