//! Priority and target planning.
//!
//! Both planners are pure functions over plain slices so the dispatcher can run
//! them under its lock and tests can drive them without any cache state.
//!
//! # Priority
//!
//! The current item gets rank 0. Ranks then grow outward, taking `ahead` items
//! in the travel direction for every `behind` items against it. When one side
//! hits the list boundary the other side keeps extending until every item is
//! ranked, so the result is always a permutation of `0..n`.
//!
//! # Target window
//!
//! Items are taken in priority order while their summed size fits the budget,
//! then the window is narrowed to the contiguous view-order span around the
//! current key. A selected item outside that span is left out of the window.

use super::control::Direction;

/// Rank every item of an `n`-item list. `result[i]` is the priority of item `i`.
pub fn assign_priorities(
    key: usize,
    direction: Direction,
    ahead: usize,
    behind: usize,
    n: usize,
) -> Vec<usize> {
    let mut priorities = vec![0usize; n];
    if n == 0 {
        return priorities;
    }

    let key = key.min(n - 1);
    let ahead = ahead.max(1);
    let behind = behind.max(1);
    let step = direction.sign();
    let in_range = |i: i64| i >= 0 && (i as usize) < n;

    let mut rank = 1usize;
    let mut ahead_pos = key as i64 + step;
    let mut behind_pos = key as i64 - step;

    while rank < n {
        for _ in 0..ahead {
            if !in_range(ahead_pos) {
                break;
            }
            priorities[ahead_pos as usize] = rank;
            rank += 1;
            ahead_pos += step;
        }
        for _ in 0..behind {
            if !in_range(behind_pos) {
                break;
            }
            priorities[behind_pos as usize] = rank;
            rank += 1;
            behind_pos -= step;
        }
    }

    priorities
}

/// Compute the target window `(first, last)` in view order.
///
/// `priorities` and `sizes` are indexed by view position. Returns `None` only
/// for an empty list. The current item is always part of the window, even when
/// it alone exceeds `max_mb`.
pub fn select_targets(
    priorities: &[usize],
    sizes: &[f64],
    current_key: usize,
    max_mb: f64,
) -> Option<(usize, usize)> {
    let n = priorities.len().min(sizes.len());
    if n == 0 {
        return None;
    }
    let current_key = current_key.min(n - 1);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| priorities[i]);

    let mut selected = vec![false; n];
    let mut sum_mb = 0.0;
    for &i in &order {
        sum_mb += sizes[i];
        if sum_mb > max_mb {
            break;
        }
        selected[i] = true;
    }
    selected[current_key] = true;

    let mut first = current_key;
    while first > 0 && selected[first - 1] {
        first -= 1;
    }
    let mut last = current_key;
    while last + 1 < n && selected[last + 1] {
        last += 1;
    }

    Some((first, last))
}
