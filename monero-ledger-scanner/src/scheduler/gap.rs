use crate::primitives::{BlockIndex, ChunkContext, ChunkRequest};

/// What to do about a chunk that came back shorter than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GapFill {
    Nothing,
    /// Schedule a request for the missing range next to the other pending chunks.
    Push(ChunkRequest),
    /// Single-flight mode: move the scan cursor back so the next launch covers the gap.
    RewindCursor(BlockIndex),
}

pub(crate) fn plan_gap_fill(
    is_terminal: bool,
    requested_size: u64,
    context: &ChunkContext,
    single_flight: bool,
) -> GapFill {
    // a short terminal chunk just means the tip was reached
    if is_terminal {
        return GapFill::Nothing;
    }

    let gap = requested_size.saturating_sub(context.len());
    if gap == 0 {
        return GapFill::Nothing;
    }

    let gap_start = context.end_index();

    if single_flight {
        GapFill::RewindCursor(gap_start)
    } else {
        GapFill::Push(ChunkRequest::new(gap_start, gap))
    }
}
