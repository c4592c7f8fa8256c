//! Pending-Storage Queue.
use std::collections::BTreeMap;

use crate::size_class::SEGMENT_SIZE;

/// 登録済みだが、まだセグメントとして実体化されていないバッキングストレージ領域のキュー.
///
/// セグメントは、どのページクラス用に使われるかが決まった時点で初めて生成されるので、
/// それまでの間、登録された領域はここに保持される.
///
/// 保持している領域群は、常に連続かつ昇順に並んでいる.
#[derive(Debug, Default)]
pub struct PendingStorage {
    extents: BTreeMap<u64, u64>,
    end: u64,
}
impl PendingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新しい領域を末尾に追加する.
    ///
    /// # Panics
    ///
    /// 以下の場合には、現在のスレッドがパニックする:
    ///
    /// - `offset`がこれまでに登録された領域の終端と一致しない
    /// - `offset`が`SEGMENT_SIZE`の倍数ではない
    /// - `size`が`0`
    pub fn push(&mut self, offset: u64, size: u64) {
        assert_eq!(
            offset % SEGMENT_SIZE,
            0,
            "misaligned extent: offset={}",
            offset
        );
        assert_eq!(
            offset, self.end,
            "non-contiguous extent: offset={}, expected={}",
            offset, self.end
        );
        assert_ne!(size, 0, "empty extent: offset={}", offset);
        self.end = offset
            .checked_add(size)
            .unwrap_or_else(|| panic!("too large extent: offset={}, size={}", offset, size));
        self.extents.insert(offset, size);
    }

    /// キューの先頭から一セグメント分の領域を取り出して、その開始位置を返す.
    ///
    /// キューが空、あるいは先頭の領域が一セグメント分に満たない場合には`None`が返される.
    pub fn claim_segment(&mut self) -> Option<u64> {
        let (&start, &len) = self.extents.iter().next()?;
        if len < SEGMENT_SIZE {
            return None;
        }
        self.extents.remove(&start);
        if len > SEGMENT_SIZE {
            self.extents.insert(start + SEGMENT_SIZE, len - SEGMENT_SIZE);
        }
        Some(start)
    }

    /// キューの先頭から`count`セグメント分の連続した領域を取り出して、その開始位置を返す.
    ///
    /// 十分な領域がない場合には`None`が返され、キューの状態は変化しない.
    pub fn claim_run(&mut self, count: u64) -> Option<u64> {
        if count == 0 || self.whole_segments() < count {
            return None;
        }
        let start = self.claim_segment()?;
        for i in 1..count {
            let next = self.claim_segment();
            debug_assert_eq!(next, Some(start + i * SEGMENT_SIZE));
        }
        Some(start)
    }

    /// キューの先頭から連続して取り出せるセグメントの数.
    pub fn whole_segments(&self) -> u64 {
        let mut total = 0;
        let mut expected = None;
        for (&start, &len) in &self.extents {
            if expected.map_or(false, |e| e != start) {
                break;
            }
            total += len;
            expected = Some(start + len);
        }
        total / SEGMENT_SIZE
    }

    /// キュー内の領域の合計サイズ.
    pub fn pending_bytes(&self) -> u64 {
        self.extents.values().sum()
    }

    /// これまでに登録された領域の終端位置.
    pub fn end(&self) -> u64 {
        self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_works() {
        let mut queue = PendingStorage::new();
        assert_eq!(queue.claim_segment(), None);

        queue.push(0, 2 * SEGMENT_SIZE);
        queue.push(2 * SEGMENT_SIZE, SEGMENT_SIZE);
        assert_eq!(queue.end(), 3 * SEGMENT_SIZE);
        assert_eq!(queue.pending_bytes(), 3 * SEGMENT_SIZE);
        assert_eq!(queue.whole_segments(), 3);

        assert_eq!(queue.claim_segment(), Some(0));
        assert_eq!(queue.claim_segment(), Some(SEGMENT_SIZE));
        assert_eq!(queue.claim_segment(), Some(2 * SEGMENT_SIZE));
        assert_eq!(queue.claim_segment(), None);
        assert_eq!(queue.pending_bytes(), 0);
        assert_eq!(queue.end(), 3 * SEGMENT_SIZE);
    }

    #[test]
    fn claim_run_works() {
        let mut queue = PendingStorage::new();
        queue.push(0, SEGMENT_SIZE);
        assert_eq!(queue.claim_run(2), None);
        assert_eq!(queue.pending_bytes(), SEGMENT_SIZE);

        queue.push(SEGMENT_SIZE, 2 * SEGMENT_SIZE);
        assert_eq!(queue.claim_run(2), Some(0));
        assert_eq!(queue.whole_segments(), 1);
        assert_eq!(queue.claim_run(1), Some(2 * SEGMENT_SIZE));
    }

    #[test]
    fn partial_extent_works() {
        let mut queue = PendingStorage::new();
        queue.push(0, SEGMENT_SIZE + 4096);
        assert_eq!(queue.claim_segment(), Some(0));
        assert_eq!(queue.pending_bytes(), 4096);
        assert_eq!(queue.claim_segment(), None);
        assert_eq!(queue.whole_segments(), 0);
    }

    #[test]
    #[should_panic]
    fn non_contiguous_push_panics() {
        let mut queue = PendingStorage::new();
        queue.push(0, SEGMENT_SIZE);
        queue.push(2 * SEGMENT_SIZE, SEGMENT_SIZE);
    }

    #[test]
    #[should_panic]
    fn misaligned_push_panics() {
        let mut queue = PendingStorage::new();
        queue.push(4096, SEGMENT_SIZE);
    }
}
