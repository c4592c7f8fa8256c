//! バッキングストレージ用のアロケータ.
//!
//! アロケータは、外部で管理されている線形なアドレス空間(e.g., ファイルやSSD)に対して、
//! 個々の割当要求に必要な部分領域を割り当てる責務を負っている.
//!
//! アロケータが担当するのは、領域の計算処理のみで、実際のデータの読み書き等を、この中で行うことは無い.
//!
//! # 構成
//!
//! ```text
//! ExternalAllocator => SegmentDescr (256MB) => Page (1MB/8MB/可変) => ブロック
//! ```
//!
//! - 登録されたストレージは、まず`PendingStorage`に保持される
//! - ページが必要になった時点で、256MB単位の`SegmentDescr`が生成される
//! - `SegmentDescr`からは、ページクラス毎に固定サイズ(`Large`の場合は可変)のページが切り出される
//! - 各ページは、単一のサイズのブロックのみを扱う
//!
//! # ブロッキングしないこと
//!
//! 割当に必要なストレージが不足している場合でも、アロケータが処理を待機することはない.
//! 代わりに[`AllocResult::NeedStorage`]で不足量が通知されるので、
//! 利用者は(非同期に)ストレージを拡張した上で[`ExternalAllocator::register_extent`]を呼び出し、
//! 同じ要求を再発行すれば良い.
//!
//! [`AllocResult::NeedStorage`]: ./enum.AllocResult.html#variant.NeedStorage
//! [`ExternalAllocator::register_extent`]: ./struct.ExternalAllocator.html#method.register_extent
use slog::Logger;
use std::collections::BTreeSet;
use std::ops::Bound::{Excluded, Unbounded};

pub use self::builder::AllocatorBuilder;

use self::arena::{Arena, Handle as PageId};
use self::page::Page;
use self::pending::PendingStorage;
use self::segment::SegmentDescr;
use crate::metrics::AllocatorMetrics;
use crate::size_class::{
    self, segments_for, PageClass, SizeClass, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, NUM_SIZE_BINS,
    SEGMENT_SHIFT, SEGMENT_SIZE,
};
use crate::{ErrorKind, Result};

mod arena;
mod builder;
mod free_range;
mod page;
mod pending;
mod segment;

/// `ExternalAllocator::allocate`の結果.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocResult {
    /// 割り当てられたブロックの、バッキングストレージ内での位置.
    Offset(u64),

    /// ストレージが不足している.
    ///
    /// 値は、追加で登録する必要があるストレージのサイズ(バイト単位).
    /// 現在の容量の末尾にこのサイズの領域を登録すれば、同じ要求は必ず成功する.
    NeedStorage(u64),
}
impl AllocResult {
    /// 割当に成功している場合には、その位置を返す.
    pub fn offset(self) -> Option<u64> {
        if let AllocResult::Offset(offset) = self {
            Some(offset)
        } else {
            None
        }
    }

    /// ストレージが不足している場合には、その不足量を返す.
    pub fn need_storage(self) -> Option<u64> {
        if let AllocResult::NeedStorage(size) = self {
            Some(size)
        } else {
            None
        }
    }
}

/// 外部ストレージ用のアロケータ.
///
/// [mimalloc]と同様に、要求サイズをサイズクラスに分類した上で、
/// 同じサイズのブロックのみを保持するページから割当を行う.
///
/// このアロケータ自体は、完全にメモリ上のデータ構造であり、状態は永続化されない.
/// 再起動時に以前の状態を引き継ぎたい場合には、
/// 割当済みの領域群を外部に保存しておき[`AllocatorBuilder::restore`]を使って復元する.
///
/// また、内部でロックは取らないので、複数スレッドから利用する場合には外部で排他を行う必要がある.
///
/// # 利用規約
///
/// 以下のような使い方はプログラムのバグとみなされ、現在のスレッドがパニックする:
///
/// - サイズが`0`、あるいは`MAX_BLOCK_SIZE`を超える割当要求
/// - 境界に沿わない、あるいは非連続なストレージの登録
/// - 割当時と異なるサイズを指定した解放
/// - 二重解放、あるいは割り当てていない位置の解放
///
/// # Examples
///
/// ```
/// use extalloc::allocator::{AllocResult, ExternalAllocator};
///
/// let mut allocator = ExternalAllocator::new();
/// assert_eq!(allocator.allocate(100), AllocResult::NeedStorage(256 * 1024 * 1024));
///
/// allocator.register_extent(0, 256 * 1024 * 1024);
/// let offset = allocator.allocate(100).offset().unwrap();
/// assert_eq!(allocator.allocated_bytes(), 4096);
///
/// allocator.free(offset, 100);
/// assert_eq!(allocator.allocated_bytes(), 0);
/// ```
///
/// [mimalloc]: https://github.com/microsoft/mimalloc
/// [`AllocatorBuilder::restore`]: ./struct.AllocatorBuilder.html#method.restore
#[derive(Debug)]
pub struct ExternalAllocator {
    // `offset >> SEGMENT_SHIFT`番目の要素が、`offset`を含むセグメント
    segments: Vec<SegmentDescr>,
    pages: Arena<Page>,

    // ページクラス毎の、まだページを切り出す余地があるセグメント群
    spare_segments: [BTreeSet<usize>; 3],

    // 未割当のセグメント群
    idle_segments: BTreeSet<usize>,

    // 跨りブロック専用に確保されている未割当のセグメント群 (セグメントの再利用が無効な場合のみ)
    reserved_segments: BTreeSet<usize>,

    // ビン毎の、空きブロックを有するページ群
    free_pages: Vec<BTreeSet<PageId>>,

    pending: PendingStorage,
    capacity: u64,
    allocated_bytes: u64,
    recycle_segments: bool,
    logger: Logger,
    metrics: AllocatorMetrics,
}
impl ExternalAllocator {
    /// デフォルト設定で、新しい(容量が`0`の)アロケータを生成する.
    ///
    /// 設定を変更したい場合には[`AllocatorBuilder`]を使用すること.
    ///
    /// [`AllocatorBuilder`]: ./struct.AllocatorBuilder.html
    pub fn new() -> Self {
        AllocatorBuilder::new().finish()
    }

    fn with_options(builder: &AllocatorBuilder) -> Self {
        ExternalAllocator {
            segments: Vec::new(),
            pages: Arena::new(),
            spare_segments: Default::default(),
            idle_segments: BTreeSet::new(),
            reserved_segments: BTreeSet::new(),
            free_pages: vec![BTreeSet::new(); NUM_SIZE_BINS],
            pending: PendingStorage::new(),
            capacity: 0,
            allocated_bytes: 0,
            recycle_segments: builder.recycle_segments,
            logger: builder.logger.clone(),
            metrics: AllocatorMetrics::new(&builder.metrics),
        }
    }

    /// `size`バイト分のブロックを割り当てる.
    ///
    /// 実際に確保されるサイズは`ExternalAllocator::good_size(size)`となる.
    ///
    /// ストレージが不足している場合には`AllocResult::NeedStorage`が返される.
    /// この場合、アロケータの状態は変化しない.
    ///
    /// # Panics
    ///
    /// `size`が`0`、あるいは`MAX_BLOCK_SIZE`を超える場合には、現在のスレッドがパニックする.
    pub fn allocate(&mut self, size: u64) -> AllocResult {
        let class = size_class::classify(size);
        let offset = if class.block_size > SEGMENT_SIZE {
            self.allocate_spanning(class)
        } else {
            self.allocate_block(class)
        };

        if let Some(offset) = offset {
            debug_assert_eq!(offset % MIN_BLOCK_SIZE, 0);
            debug_assert!(offset + class.block_size <= self.capacity);
            self.allocated_bytes += class.block_size;
            self.metrics.count_allocation(class.block_size);
            AllocResult::Offset(offset)
        } else {
            let needed = self.storage_shortfall(class);
            self.metrics.need_storage.increment();
            debug!(self.logger, "Backing storage is required";
                   "size" => size, "class" => class.page_class.as_str(), "needed" => needed);
            AllocResult::NeedStorage(needed)
        }
    }

    /// 割当済みのブロックを解放する.
    ///
    /// `size`には、割当時に指定したものと同じ値を渡す必要がある.
    ///
    /// # Panics
    ///
    /// 以下の場合には、現在のスレッドがパニックする:
    ///
    /// - `offset`が割当済みのブロックを指していない (二重解放を含む)
    /// - `size`が割当時と異なるブロックサイズに分類される
    pub fn free(&mut self, offset: u64, size: u64) {
        let class = size_class::classify(size);
        let index = (offset >> SEGMENT_SHIFT) as usize;
        assert!(
            index < self.segments.len(),
            "unknown offset: offset={}",
            offset
        );

        let segment = &self.segments[index];
        assert!(
            !segment.is_unassigned() && segment.continuation_of().is_none(),
            "unknown offset: offset={}",
            offset
        );
        assert_eq!(
            segment.page_class(),
            Some(class.page_class),
            "size mismatch: offset={}, size={}",
            offset,
            size
        );
        let relative = offset - segment.base();
        let id = segment
            .find_page(&self.pages, relative)
            .unwrap_or_else(|| panic!("unknown offset: offset={}", offset));

        let page = self.pages.get_mut(id).expect("Never fails");
        assert_eq!(
            page.block_size(),
            class.block_size,
            "size mismatch: offset={}, size={}",
            offset,
            size
        );
        let was_full = page.is_full();
        page.release(relative - page.offset());
        let is_empty = page.is_empty();

        self.allocated_bytes -= class.block_size;
        self.metrics.count_releasion(class.block_size);

        if is_empty {
            self.free_pages[class.bin].remove(&id);
            self.reclaim_page(index, id, class.page_class);
        } else if was_full {
            self.free_pages[class.bin].insert(id);
        }
    }

    /// バッキングストレージを登録する.
    ///
    /// ストレージは先頭から隙間なく登録していく必要がある.
    /// 例えば`[0, 256MB)`が登録されたなら、次は`[256MB, ...)`を登録する.
    ///
    /// `size`は`SEGMENT_SIZE`の倍数であることが望ましい.
    /// そうではない場合、末尾の端数はセグメント化されず、以後の登録も行えなくなる.
    ///
    /// # Panics
    ///
    /// 以下の場合には、現在のスレッドがパニックする:
    ///
    /// - `offset`が`SEGMENT_SIZE`の倍数ではない
    /// - `offset`が`self.capacity()`と等しくない
    /// - `size`が`0`
    pub fn register_extent(&mut self, offset: u64, size: u64) {
        assert_eq!(offset, self.capacity, "non-contiguous extent");
        self.pending.push(offset, size);
        self.capacity += size;
        debug_assert_eq!(self.capacity, self.pending.end());
        self.metrics.capacity_bytes.set(self.capacity as f64);
        self.update_pending_metrics();
        info!(self.logger, "Backing storage is registered";
              "offset" => offset, "size" => size, "capacity" => self.capacity);
    }

    /// `size`分の割当を要求した際に、実際に確保されるブロックのサイズを返す.
    ///
    /// 結果は`size`以上であることが保証されている.
    ///
    /// # Panics
    ///
    /// `size`が`0`、あるいは`MAX_BLOCK_SIZE`を超える場合には、現在のスレッドがパニックする.
    pub fn good_size(size: u64) -> u64 {
        size_class::good_size(size)
    }

    /// 登録済みのストレージの合計サイズ.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// 割当済みのブロックの合計サイズ.
    ///
    /// ページやセグメント内の未使用領域は含まれない.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    /// 登録済みだが、まだセグメント化されていないストレージのサイズ.
    pub fn pending_bytes(&self) -> u64 {
        self.pending.pending_bytes()
    }

    /// これまでに生成されたセグメントの数.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// アロケータのメトリクスを返す.
    pub fn metrics(&self) -> &AllocatorMetrics {
        &self.metrics
    }

    fn allocate_block(&mut self, class: SizeClass) -> Option<u64> {
        let cached = if class.page_class == PageClass::Large {
            None
        } else {
            self.free_pages[class.bin].iter().next().cloned()
        };
        let id = match cached {
            Some(id) => id,
            None => self.new_page(class)?,
        };
        Some(self.allocate_from(id))
    }

    fn allocate_spanning(&mut self, class: SizeClass) -> Option<u64> {
        let count = segments_for(class.block_size);
        let head = if let Some(head) = self.find_vacant_run(count) {
            head
        } else {
            // 末尾の未割当セグメント群の後ろに、キューの先頭の領域を継ぎ足す
            let tail = self.trailing_vacant_run();
            let base = self.pending.claim_run(count - tail)?;
            debug_assert_eq!(base >> SEGMENT_SHIFT, self.segments.len() as u64);
            for i in 0..count - tail {
                self.materialize(base + i * SEGMENT_SIZE);
            }
            self.segments.len() - count as usize
        };
        let id = self.carve_spanning_page(head, count as usize, class);
        Some(self.allocate_from(id))
    }

    fn allocate_from(&mut self, id: PageId) -> u64 {
        let page = self.pages.get_mut(id).expect("Never fails");
        let block = page
            .try_allocate()
            .expect("a full page is found in the free list");
        if page.is_full() {
            self.free_pages[page.bin()].remove(&id);
        }
        segment_base(page.segment()) + page.offset() + block
    }

    // 既存のセグメント、あるいは新規に取得したセグメントから、ページを切り出す.
    fn new_page(&mut self, class: SizeClass) -> Option<PageId> {
        let spare = &self.spare_segments[class.page_class.index()];
        let mut next = spare.iter().next().cloned();
        while let Some(index) = next {
            if let Some(id) = self.carve_page(index, class) {
                return Some(id);
            }
            next = self.spare_segments[class.page_class.index()]
                .range((Excluded(index), Unbounded))
                .next()
                .cloned();
        }

        let index = self.claim_segment()?;
        let id = self.carve_page(index, class);
        debug_assert!(id.is_some());
        id
    }

    fn carve_page(&mut self, index: usize, class: SizeClass) -> Option<PageId> {
        let id = self.segments[index].carve_page(
            &mut self.pages,
            class.page_class,
            class.bin,
            class.block_size,
        )?;
        self.metrics.pages_carved.increment(class.page_class);
        if class.page_class != PageClass::Large {
            self.free_pages[class.bin].insert(id);
        }
        self.refresh_segment(index);
        Some(id)
    }

    fn carve_spanning_page(&mut self, head: usize, count: usize, class: SizeClass) -> PageId {
        let id =
            self.segments[head].carve_spanning_page(&mut self.pages, class.bin, class.block_size);
        for index in head + 1..head + count {
            self.segments[index].mark_continuation(head);
        }
        for index in head..head + count {
            self.refresh_segment(index);
        }
        self.metrics.pages_carved.increment(PageClass::Large);
        debug!(self.logger, "A spanning page is carved";
               "segment" => head, "segments" => count, "size" => class.block_size);
        id
    }

    // 未割当のセグメントを一つ取得する.
    //
    // 再利用可能なものがあればそれを優先し、なければキューから新規に生成する.
    fn claim_segment(&mut self) -> Option<usize> {
        if let Some(index) = self.idle_segments.iter().next().cloned() {
            self.idle_segments.remove(&index);
            return Some(index);
        }
        let base = self.pending.claim_segment()?;
        Some(self.materialize(base))
    }

    fn is_vacant(&self, index: usize) -> bool {
        self.idle_segments.contains(&index) || self.reserved_segments.contains(&index)
    }

    // 連続する`count`個の未割当セグメントを探す.
    fn find_vacant_run(&self, count: u64) -> Option<usize> {
        let mut run: Option<(usize, u64)> = None;
        for &index in self.idle_segments.union(&self.reserved_segments) {
            run = match run {
                Some((head, len)) if head + len as usize == index => Some((head, len + 1)),
                _ => Some((index, 1)),
            };
            if let Some((head, len)) = run {
                if len == count {
                    return Some(head);
                }
            }
        }
        None
    }

    // 末尾(キューの先頭と隣接する位置)に連続している未割当セグメントの数.
    fn trailing_vacant_run(&self) -> u64 {
        (0..self.segments.len())
            .rev()
            .take_while(|&i| self.is_vacant(i))
            .count() as u64
    }

    fn materialize(&mut self, base: u64) -> usize {
        let index = (base >> SEGMENT_SHIFT) as usize;
        assert_eq!(index, self.segments.len());
        self.segments.push(SegmentDescr::new(index));
        self.metrics.segments_claimed.increment();
        self.update_pending_metrics();
        debug!(self.logger, "A new segment is claimed"; "segment" => index, "base" => base);
        index
    }

    // `index`番目までのセグメントを生成する.
    //
    // 新たに生成されたセグメントは、未割当のまま保持される.
    fn materialize_through(&mut self, index: usize) -> Result<()> {
        while self.segments.len() <= index {
            let base = track_assert_some!(
                self.pending.claim_segment(),
                ErrorKind::InvalidInput,
                "no storage for segment {}",
                index
            );
            let claimed = self.materialize(base);
            self.idle_segments.insert(claimed);
        }
        Ok(())
    }

    fn reclaim_page(&mut self, index: usize, id: PageId, class: PageClass) {
        let emptied = self.segments[index].reclaim(&mut self.pages, id);
        self.metrics.pages_reclaimed.increment(class);
        debug_assert_eq!(self.pages.len() as u64, self.metrics.live_pages());
        if emptied {
            debug_assert_eq!(self.segments[index].cursor(), 0);
            let run = 1 + (index + 1..self.segments.len())
                .take_while(|&i| self.segments[i].continuation_of() == Some(index))
                .count();
            for i in index..index + run {
                if self.recycle_segments {
                    self.recycle_segment(i);
                } else if run > 1 {
                    self.reserve_segment(i);
                }
            }
        }
        self.refresh_segment(index);
    }

    fn recycle_segment(&mut self, index: usize) {
        self.segments[index].reset();
        self.refresh_segment(index);
        self.metrics.segments_recycled.increment();
        debug!(self.logger, "A segment is recycled"; "segment" => index);
    }

    // 跨りブロック用のセグメントを、以後も跨りブロック専用として保持する.
    fn reserve_segment(&mut self, index: usize) {
        self.segments[index].reset();
        self.reserved_segments.insert(index);
        self.refresh_segment(index);
        debug!(self.logger, "A segment is reserved for spanning blocks"; "segment" => index);
    }

    // セグメントが所属すべきリストを更新する.
    fn refresh_segment(&mut self, index: usize) {
        for spare in &mut self.spare_segments {
            spare.remove(&index);
        }
        self.idle_segments.remove(&index);

        let segment = &self.segments[index];
        match segment.page_class() {
            None => {
                if !self.reserved_segments.contains(&index) {
                    self.idle_segments.insert(index);
                }
            }
            Some(class) => {
                self.reserved_segments.remove(&index);
                if segment.has_room() {
                    self.spare_segments[class.index()].insert(index);
                }
            }
        }
    }

    fn storage_shortfall(&self, class: SizeClass) -> u64 {
        if class.block_size <= SEGMENT_SIZE {
            SEGMENT_SIZE
        } else {
            let count = segments_for(class.block_size);
            let available = self.trailing_vacant_run() + self.pending.whole_segments();
            (count - available.min(count)) * SEGMENT_SIZE
        }
    }

    fn update_pending_metrics(&self) {
        self.metrics
            .pending_bytes
            .set(self.pending.pending_bytes() as f64);
    }

    /// 指定された位置のブロックを割当済みとして登録する.
    ///
    /// 状態の復元用.
    /// 位置は昇順で渡される必要がある.
    pub(crate) fn restore_allocation(&mut self, offset: u64, size: u64) -> Result<()> {
        track_assert!(
            size != 0 && size <= MAX_BLOCK_SIZE,
            ErrorKind::InvalidInput,
            "offset={}, size={}",
            offset,
            size
        );
        let class = size_class::classify(size);
        track_assert_eq!(
            offset % MIN_BLOCK_SIZE,
            0,
            ErrorKind::InvalidInput,
            "misaligned allocation: offset={}",
            offset
        );
        let end = track_assert_some!(
            offset.checked_add(class.block_size),
            ErrorKind::InvalidInput
        );
        track_assert!(
            end <= self.capacity,
            ErrorKind::InvalidInput,
            "out of capacity: offset={}, size={}",
            offset,
            size
        );

        let index = (offset >> SEGMENT_SHIFT) as usize;
        if class.block_size > SEGMENT_SIZE {
            track!(self.restore_spanning(index, offset, class))?;
        } else {
            track!(self.restore_block(index, offset, class))?;
        }
        self.allocated_bytes += class.block_size;
        self.metrics.count_restored_allocation(class.block_size);
        Ok(())
    }

    fn restore_spanning(&mut self, head: usize, offset: u64, class: SizeClass) -> Result<()> {
        track_assert_eq!(
            offset % SEGMENT_SIZE,
            0,
            ErrorKind::InvalidInput,
            "misaligned allocation: offset={}",
            offset
        );
        let count = segments_for(class.block_size) as usize;
        track!(self.materialize_through(head + count - 1))?;
        for index in head..head + count {
            track_assert!(
                self.is_vacant(index),
                ErrorKind::InvalidInput,
                "overlapping allocation: offset={}",
                offset
            );
        }

        let id = self.carve_spanning_page(head, count, class);
        let page = track_assert_some!(self.pages.get_mut(id), ErrorKind::InconsistentState);
        track_assert!(page.mark_used(0), ErrorKind::InconsistentState);
        Ok(())
    }

    fn restore_block(&mut self, index: usize, offset: u64, class: SizeClass) -> Result<()> {
        track!(self.materialize_through(index))?;

        let segment = &mut self.segments[index];
        let relative = offset - segment.base();
        let id = if let Some(id) = segment.find_page(&self.pages, relative) {
            id
        } else {
            let page_offset = class
                .page_class
                .page_size()
                .map_or(relative, |unit| relative / unit * unit);
            let id = track_assert_some!(
                segment.carve_page_at(
                    &mut self.pages,
                    class.page_class,
                    page_offset,
                    class.bin,
                    class.block_size
                ),
                ErrorKind::InvalidInput,
                "conflicting allocation: offset={}, block_size={}",
                offset,
                class.block_size
            );
            self.metrics.pages_carved.increment(class.page_class);
            if class.page_class != PageClass::Large {
                self.free_pages[class.bin].insert(id);
            }
            id
        };

        let page = track_assert_some!(self.pages.get_mut(id), ErrorKind::InconsistentState);
        track_assert_eq!(
            page.block_size(),
            class.block_size,
            ErrorKind::InvalidInput,
            "conflicting allocation: offset={}",
            offset
        );
        track_assert!(
            page.mark_used(relative - page.offset()),
            ErrorKind::InvalidInput,
            "overlapping allocation: offset={}",
            offset
        );
        if page.is_full() {
            self.free_pages[class.bin].remove(&id);
        }
        self.refresh_segment(index);
        Ok(())
    }
}
impl Default for ExternalAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn segment_base(index: usize) -> u64 {
    (index as u64) << SEGMENT_SHIFT
}

#[cfg(test)]
mod tests {
    use prometrics::metrics::MetricBuilder;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    use super::*;
    use crate::size_class::{LARGE_BLOCK_ALIGNMENT, MEDIUM_PAGE_SIZE, SMALL_PAGE_SIZE};

    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;

    #[test]
    fn it_works() {
        let mut allocator = ExternalAllocator::new();
        assert_eq!(allocator.capacity(), 0);
        assert_eq!(
            allocator.allocate(100),
            AllocResult::NeedStorage(SEGMENT_SIZE)
        );

        allocator.register_extent(0, SEGMENT_SIZE);
        let offset = allocator.allocate(100).offset().unwrap();
        assert!(offset < SEGMENT_SIZE);
        assert_eq!(allocator.allocated_bytes(), 4 * KB);

        allocator.free(offset, 100);
        assert_eq!(allocator.capacity(), SEGMENT_SIZE);
        assert_eq!(allocator.allocated_bytes(), 0);

        let m = allocator.metrics();
        assert_eq!(m.capacity_bytes(), SEGMENT_SIZE);
        assert_eq!(m.allocations(), 1);
        assert_eq!(m.releases(), 1);
        assert_eq!(m.need_storage(), 1);
        assert_eq!(m.segments_claimed(), 1);
        assert_eq!(m.segments_recycled(), 1);
        assert_eq!(m.usage_bytes(), 0);
        assert_eq!(m.live_pages(), 0);
    }

    #[test]
    fn same_bin_shares_page() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        let a = allocator.allocate(4 * KB).offset().unwrap();
        let b = allocator.allocate(4 * KB).offset().unwrap();
        let c = allocator.allocate(5 * KB).offset().unwrap();
        assert_eq!(b, a + 4 * KB);

        // 別のビンは別のページになる
        assert_eq!(c % SMALL_PAGE_SIZE, 0);
        assert_ne!(c / SMALL_PAGE_SIZE, a / SMALL_PAGE_SIZE);
        assert_eq!(allocator.metrics().pages_carved().small(), 2);

        // 解放されたブロックは再利用される
        allocator.free(a, 4 * KB);
        assert_eq!(allocator.allocate(1).offset(), Some(a));
    }

    #[test]
    fn page_classes_do_not_share_segments() {
        let mut allocator = allocator_with(2 * SEGMENT_SIZE);
        let small = allocator.allocate(100).offset().unwrap();
        let medium = allocator.allocate(200 * KB).offset().unwrap();
        assert_eq!(small >> SEGMENT_SHIFT, 0);
        assert_eq!(medium >> SEGMENT_SHIFT, 1);
        assert_eq!(allocator.segment_count(), 2);

        // 三つ目のページクラスには、もうセグメントが無い
        assert_eq!(
            allocator.allocate(2 * MB),
            AllocResult::NeedStorage(SEGMENT_SIZE)
        );
        allocator.register_extent(2 * SEGMENT_SIZE, SEGMENT_SIZE);
        let large = allocator.allocate(2 * MB).offset().unwrap();
        assert_eq!(large >> SEGMENT_SHIFT, 2);
    }

    #[test]
    fn full_page_leaves_free_list() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        let blocks = (0..8)
            .map(|_| allocator.allocate(128 * KB).offset().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(blocks[7], 7 * 128 * KB);
        assert!(allocator.free_pages[18].is_empty());

        // 次のブロックは新しいページから
        let next = allocator.allocate(128 * KB).offset().unwrap();
        assert_eq!(next, SMALL_PAGE_SIZE);
        assert_eq!(allocator.free_pages[18].len(), 1);

        // 満杯だったページに空きができると、リストに戻る
        allocator.free(blocks[3], 128 * KB);
        assert_eq!(allocator.free_pages[18].len(), 2);
        assert_eq!(allocator.allocate(128 * KB).offset(), Some(blocks[3]));
    }

    #[test]
    fn large_block_works() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        let size = 2_000_000;
        let good = ExternalAllocator::good_size(size);
        assert!(good >= size);
        assert_eq!(good % LARGE_BLOCK_ALIGNMENT, 0);

        let a = allocator.allocate(size).offset().unwrap();
        let b = allocator.allocate(size).offset().unwrap();
        assert_eq!(b, a + good);
        assert_eq!(allocator.allocated_bytes(), 2 * good);
        assert_eq!(allocator.metrics().pages_carved().large(), 2);

        allocator.free(a, size);
        let c = allocator.allocate(1_500_000).offset().unwrap();
        assert_eq!(c, a);
        allocator.free(b, size);
        allocator.free(c, 1_500_000);
        assert_eq!(allocator.allocated_bytes(), 0);
        assert_eq!(allocator.metrics().live_pages(), 0);
    }

    #[test]
    fn spanning_block_works() {
        let mut allocator = allocator_with(SEGMENT_SIZE);

        let size = 2 * SEGMENT_SIZE + 1;
        let needed = allocator.allocate(size).need_storage().unwrap();
        assert_eq!(needed, 2 * SEGMENT_SIZE);

        allocator.register_extent(allocator.capacity(), needed);
        let offset = allocator.allocate(size).offset().unwrap();
        assert_eq!(offset, 0);
        assert_eq!(allocator.segment_count(), 3);
        assert_eq!(allocator.allocated_bytes(), ExternalAllocator::good_size(size));

        // 跨られているセグメントは他の要求には使われない
        assert_eq!(
            allocator.allocate(100),
            AllocResult::NeedStorage(SEGMENT_SIZE)
        );

        allocator.free(offset, size);
        assert_eq!(allocator.metrics().segments_recycled(), 3);
        assert_eq!(allocator.allocated_bytes(), 0);

        // 空き状態に戻ったセグメント群は、再び跨りブロックに使える
        assert_eq!(allocator.allocate(size).offset(), Some(0));
        assert_eq!(allocator.segment_count(), 3);
        allocator.free(0, size);
        assert_eq!(allocator.allocate(100).offset(), Some(0));
    }

    #[test]
    fn segment_recycling_works() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        let small = allocator.allocate(100).offset().unwrap();
        assert_eq!(
            allocator.allocate(200 * KB),
            AllocResult::NeedStorage(SEGMENT_SIZE)
        );

        // 空になったセグメントは、別のページクラスで再利用される
        allocator.free(small, 100);
        let medium = allocator.allocate(200 * KB).offset().unwrap();
        assert_eq!(medium, 0);
        assert_eq!(allocator.segment_count(), 1);
    }

    #[test]
    fn segment_recycling_can_be_disabled() {
        let mut allocator = AllocatorBuilder::new().recycle_segments(false).finish();
        allocator.register_extent(0, SEGMENT_SIZE);

        let small = allocator.allocate(100).offset().unwrap();
        allocator.free(small, 100);
        assert_eq!(allocator.metrics().segments_recycled(), 0);
        assert_eq!(
            allocator.allocate(200 * KB),
            AllocResult::NeedStorage(SEGMENT_SIZE)
        );
        assert_eq!(allocator.allocate(100).offset(), Some(small));
    }

    #[test]
    fn exhausting_a_segment_works() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        let count = SEGMENT_SIZE / MEDIUM_PAGE_SIZE * 8;
        let blocks = (0..count)
            .map(|_| allocator.allocate(MB).offset().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(allocator.allocated_bytes(), SEGMENT_SIZE);
        assert_eq!(
            allocator.allocate(MB),
            AllocResult::NeedStorage(SEGMENT_SIZE)
        );

        allocator.register_extent(SEGMENT_SIZE, SEGMENT_SIZE);
        let extra = allocator.allocate(MB).offset().unwrap();
        assert_eq!(extra, SEGMENT_SIZE);

        for offset in blocks {
            allocator.free(offset, MB);
        }
        allocator.free(extra, MB);
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn repeated_alloc_and_free_needs_one_extent() {
        let mut allocator = ExternalAllocator::new();
        let mut need_storage = 0;
        for &size in &[100, 100_000, 500_000, 3_000_000] {
            for _ in 0..100 {
                let offsets = (0..20)
                    .map(|_| allocate_or_grow(&mut allocator, size, &mut need_storage))
                    .collect::<Vec<_>>();
                for offset in offsets {
                    allocator.free(offset, size);
                }
            }
        }
        assert_eq!(need_storage, 1);
        assert_eq!(allocator.capacity(), SEGMENT_SIZE);
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn random_workload_works() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut allocator = ExternalAllocator::new();
        let mut need_storage = 0;
        let mut live = BTreeMap::new();
        let mut expected_bytes = 0;

        for _ in 0..5000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = match rng.gen_range(0..10) {
                    0 => rng.gen_range(MB + 1..=64 * MB),
                    1..=3 => rng.gen_range(128 * KB + 1..=MB),
                    _ => rng.gen_range(1..=128 * KB),
                };
                let offset = allocate_or_grow(&mut allocator, size, &mut need_storage);
                let good = ExternalAllocator::good_size(size);
                assert!(offset + good <= allocator.capacity());
                assert_eq!(offset % MIN_BLOCK_SIZE, 0);

                // 生存中のブロックと重ならない
                if let Some((&prev, &(prev_size, _))) = live.range(..offset).next_back() {
                    assert!(prev + ExternalAllocator::good_size(prev_size) <= offset);
                }
                if let Some((&next, _)) = live.range(offset..).next() {
                    assert!(offset + good <= next);
                }
                live.insert(offset, (size, good));
                expected_bytes += good;
            } else {
                let keys = live.keys().cloned().collect::<Vec<_>>();
                let offset = *keys.choose(&mut rng).unwrap();
                let (size, good) = live.remove(&offset).unwrap();
                allocator.free(offset, size);
                expected_bytes -= good;
            }
            assert_eq!(allocator.allocated_bytes(), expected_bytes);
        }

        let mut rest = live.into_iter().collect::<Vec<_>>();
        rest.shuffle(&mut rng);
        for (offset, (size, _)) in rest {
            allocator.free(offset, size);
        }
        assert_eq!(allocator.allocated_bytes(), 0);
        assert_eq!(allocator.metrics().live_pages(), 0);
    }

    #[test]
    fn progress_is_guaranteed() {
        for &size in &[1, 200 * KB, 5 * MB, SEGMENT_SIZE, SEGMENT_SIZE + 1, 3 * SEGMENT_SIZE] {
            let mut allocator = ExternalAllocator::new();
            let needed = allocator.allocate(size).need_storage().unwrap();
            let capacity = allocator.capacity();
            allocator.register_extent(capacity, needed);
            assert!(allocator.allocate(size).offset().is_some(), "size={}", size);
        }
    }

    #[test]
    fn metrics_builder_works() {
        let allocator = AllocatorBuilder::new()
            .metrics(MetricBuilder::new())
            .finish();
        assert_eq!(allocator.metrics().capacity_bytes(), 0);
        assert_eq!(allocator.pending_bytes(), 0);
    }

    #[test]
    fn spanning_segments_are_kept_without_recycling() {
        let mut allocator = AllocatorBuilder::new().recycle_segments(false).finish();
        let size = SEGMENT_SIZE + 1;
        let mut grows = 0;
        for _ in 0..5 {
            let offset = allocate_or_grow(&mut allocator, size, &mut grows);
            assert_eq!(offset, 0);
            allocator.free(offset, size);
        }
        assert_eq!(grows, 1);
        assert_eq!(allocator.capacity(), 2 * SEGMENT_SIZE);
        assert_eq!(allocator.metrics().segments_recycled(), 0);

        // 跨りブロック専用のセグメントは、他の要求には使われない
        assert_eq!(
            allocator.allocate(100),
            AllocResult::NeedStorage(SEGMENT_SIZE)
        );

        // より大きな跨りブロックは、専用セグメントの後ろに新しい領域を継ぎ足して配置される
        let larger = 2 * SEGMENT_SIZE + 1;
        assert_eq!(
            allocator.allocate(larger),
            AllocResult::NeedStorage(SEGMENT_SIZE)
        );
        allocator.register_extent(2 * SEGMENT_SIZE, SEGMENT_SIZE);
        assert_eq!(allocator.allocate(larger).offset(), Some(0));
        assert_eq!(allocator.segment_count(), 3);
    }

    #[test]
    fn trailing_idle_segment_is_extended() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        let small = allocator.allocate(100).offset().unwrap();
        allocator.free(small, 100);

        let size = SEGMENT_SIZE + 1;
        assert_eq!(
            allocator.allocate(size),
            AllocResult::NeedStorage(SEGMENT_SIZE)
        );
        allocator.register_extent(SEGMENT_SIZE, SEGMENT_SIZE);
        assert_eq!(allocator.allocate(size).offset(), Some(0));
        assert_eq!(allocator.segment_count(), 2);
    }

    #[test]
    fn max_block_size_works() {
        let mut allocator = ExternalAllocator::new();
        assert_eq!(
            allocator.allocate(MAX_BLOCK_SIZE),
            AllocResult::NeedStorage(MAX_BLOCK_SIZE)
        );
        assert_eq!(allocator.capacity(), 0);
    }

    #[test]
    #[should_panic]
    fn too_large_size_panics() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        allocator.allocate(u64::MAX);
    }

    #[test]
    #[should_panic]
    fn zero_size_panics() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        allocator.allocate(0);
    }

    #[test]
    #[should_panic]
    fn double_free_panics() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        let a = allocator.allocate(100).offset().unwrap();
        let _b = allocator.allocate(100).offset().unwrap();
        allocator.free(a, 100);
        allocator.free(a, 100);
    }

    #[test]
    #[should_panic]
    fn mismatched_size_panics() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        let a = allocator.allocate(100).offset().unwrap();
        allocator.free(a, 10_000);
    }

    #[test]
    #[should_panic]
    fn unknown_offset_panics() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        allocator.free(SEGMENT_SIZE * 5, 100);
    }

    #[test]
    #[should_panic]
    fn non_contiguous_extent_panics() {
        let mut allocator = allocator_with(SEGMENT_SIZE);
        allocator.register_extent(2 * SEGMENT_SIZE, SEGMENT_SIZE);
    }

    fn allocator_with(capacity: u64) -> ExternalAllocator {
        let mut allocator = ExternalAllocator::new();
        allocator.register_extent(0, capacity);
        allocator
    }

    fn allocate_or_grow(allocator: &mut ExternalAllocator, size: u64, grows: &mut usize) -> u64 {
        match allocator.allocate(size) {
            AllocResult::Offset(offset) => offset,
            AllocResult::NeedStorage(needed) => {
                *grows += 1;
                let capacity = allocator.capacity();
                allocator.register_extent(capacity, needed);
                allocator.allocate(size).offset().expect("progress")
            }
        }
    }
}
