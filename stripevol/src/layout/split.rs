use super::StripeLayout;

/// Piece of a logical range that lands on a single stripe unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeSpan {
    pub stripe: usize,
    /// Where the piece starts in the logical object.
    pub logical_offset: u64,
    /// Where the piece starts in the stripe's sub-object.
    pub local_offset: u64,
    pub len: usize,
}

impl StripeLayout {
    /// Walks `[offset, offset + len)` one stripe unit at a time.
    ///
    /// Spans come out in logical order, so consecutive spans usually belong
    /// to different stripes.
    pub fn split_range(&self, mut offset: u64, len: usize) -> Vec<StripeSpan> {
        let mut remaining = len as u64;
        let mut out = Vec::new();
        while remaining > 0 {
            let stripe = self.stripe_of(offset);
            let within_unit = offset % self.stripe_size;
            let cap = self.stripe_size - within_unit;
            let take = cap.min(remaining);
            out.push(StripeSpan {
                stripe,
                logical_offset: offset,
                local_offset: self.stripe_offset(stripe, offset),
                len: take as usize,
            });
            offset = match offset.checked_add(take) {
                Some(next) => next,
                None => break,
            };
            remaining -= take;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SS: u64 = 4096;

    fn layout() -> StripeLayout {
        StripeLayout::from_targets(1, SS, [(0, 10), (1, 11), (2, 12)]).unwrap()
    }

    #[test]
    fn test_split_within_single_unit() {
        let spans = layout().split_range(123, 100);
        assert_eq!(
            spans,
            vec![StripeSpan {
                stripe: 0,
                logical_offset: 123,
                local_offset: 123,
                len: 100
            }]
        );
    }

    #[test]
    fn test_split_wraps_to_next_round() {
        let l = layout();
        let start = 3 * SS - 10;
        let spans = l.split_range(start, 20);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].stripe, 2);
        assert_eq!(spans[0].local_offset, SS - 10);
        assert_eq!(spans[0].len, 10);
        assert_eq!(spans[1].stripe, 0);
        assert_eq!(spans[1].local_offset, SS);
        assert_eq!(spans[1].logical_offset, 3 * SS);
        assert_eq!(spans[1].len, 10);
    }

    #[test]
    fn test_split_empty() {
        assert!(layout().split_range(77, 0).is_empty());
    }
}
