//! `Large`セグメント用の空き領域リスト.
use std::cmp;
use std::collections::BTreeSet;
use std::ops::Bound::{Excluded, Included, Unbounded};

/// セグメント内の空き(割当可能)領域.
///
/// 位置はセグメント先頭からの相対値(バイト単位).
#[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq)]
pub struct FreeRange {
    start: u64,
    len: u64,
}
impl FreeRange {
    pub fn new(start: u64, len: u64) -> Self {
        FreeRange { start, len }
    }

    pub fn start(self) -> u64 {
        self.start
    }

    pub fn end(self) -> u64 {
        self.start + self.len
    }

    pub fn len(self) -> u64 {
        self.len
    }

    pub fn is_empty(self) -> bool {
        self.len == 0
    }
}

/// 比較が"空き領域のサイズ順"で行われる`FreeRange`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SizeBasedFreeRange(FreeRange);
impl PartialOrd for SizeBasedFreeRange {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SizeBasedFreeRange {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        match self.0.len().cmp(&other.0.len()) {
            cmp::Ordering::Equal => self.0.start().cmp(&other.0.start()),
            not_equal => not_equal,
        }
    }
}

/// 比較が"終端位置が小さい順"で行われる`FreeRange`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EndBasedFreeRange(FreeRange);
impl PartialOrd for EndBasedFreeRange {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for EndBasedFreeRange {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.0.end().cmp(&other.0.end())
    }
}

/// 解放済み領域を"BestFit"戦略で再利用するためのリスト.
///
/// 要求サイズを満たす空き領域の中で、一番サイズが小さいものが選択される.
/// 解放時には、隣接する空き領域との結合が行われる.
#[derive(Debug, Default)]
pub struct FreeRanges {
    size_to_free: BTreeSet<SizeBasedFreeRange>,
    end_to_free: BTreeSet<EndBasedFreeRange>,
}
impl FreeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// `size`分の領域を割り当てて、その開始位置を返す.
    ///
    /// 十分な領域が存在しない場合には`None`が返される.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let key = SizeBasedFreeRange(FreeRange::new(0, size));
        let free = self
            .size_to_free
            .range((Included(&key), Unbounded))
            .next()
            .map(|r| r.0)?;
        self.delete(free);
        if free.len() > size {
            self.add(FreeRange::new(free.start() + size, free.len() - size));
        }
        Some(free.start())
    }

    /// 指定範囲の領域を割当済みにする.
    ///
    /// 範囲全体が一つの空き領域に含まれていない場合には`false`が返され、状態は変化しない.
    pub fn take(&mut self, start: u64, len: u64) -> bool {
        let key = EndBasedFreeRange(FreeRange::new(start, 0));
        let free = match self
            .end_to_free
            .range((Excluded(&key), Unbounded))
            .next()
            .map(|r| r.0)
        {
            Some(free) => free,
            None => return false,
        };
        if !(free.start() <= start && start + len <= free.end()) {
            return false;
        }

        self.delete(free);
        let prefix = FreeRange::new(free.start(), start - free.start());
        let suffix = FreeRange::new(start + len, free.end() - (start + len));
        for r in &[prefix, suffix] {
            if !r.is_empty() {
                self.add(*r);
            }
        }
        true
    }

    /// 領域を解放してリストに戻す.
    ///
    /// 隣接する空き領域が存在する場合には、それらとまとめられる.
    /// 結合後の領域が返される.
    pub fn release(&mut self, start: u64, len: u64) -> FreeRange {
        let mut range = FreeRange::new(start, len);

        // `range`の始端に一致する終端を持つ領域
        let key = EndBasedFreeRange(FreeRange::new(range.start(), 0));
        if let Some(prev) = self.end_to_free.get(&key).map(|r| r.0) {
            self.delete(prev);
            range = FreeRange::new(prev.start(), prev.len() + range.len());
        }

        // `range`の終端に一致する始端を持つ領域
        let key = EndBasedFreeRange(FreeRange::new(range.end(), 0));
        if let Some(next) = self
            .end_to_free
            .range((Excluded(&key), Unbounded))
            .next()
            .map(|r| r.0)
        {
            assert!(next.start() >= range.end(), "overlapping release: {:?}", range);
            if next.start() == range.end() {
                self.delete(next);
                range = FreeRange::new(range.start(), range.len() + next.len());
            }
        }

        self.add(range);
        range
    }

    /// 終端が`end`に一致する空き領域を取り除いて返す.
    pub fn remove_ending_at(&mut self, end: u64) -> Option<FreeRange> {
        let key = EndBasedFreeRange(FreeRange::new(end, 0));
        let range = self.end_to_free.get(&key).map(|r| r.0)?;
        self.delete(range);
        Some(range)
    }

    /// 一番大きな空き領域のサイズ.
    pub fn max_len(&self) -> u64 {
        self.size_to_free.iter().next_back().map_or(0, |r| r.0.len())
    }

    pub fn clear(&mut self) {
        self.size_to_free.clear();
        self.end_to_free.clear();
    }

    fn add(&mut self, range: FreeRange) {
        assert!(self.size_to_free.insert(SizeBasedFreeRange(range)));
        assert!(self.end_to_free.insert(EndBasedFreeRange(range)));
    }

    fn delete(&mut self, range: FreeRange) {
        assert!(self.size_to_free.remove(&SizeBasedFreeRange(range)));
        assert!(self.end_to_free.remove(&EndBasedFreeRange(range)));
    }
}
