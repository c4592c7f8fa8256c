//! Segment Descriptor.
use std::collections::{BTreeMap, BTreeSet};

use super::arena::{Arena, Handle};
use super::free_range::FreeRanges;
use super::page::Page;
use crate::size_class::{PageClass, SEGMENT_SHIFT, SEGMENT_SIZE};

/// バッキングストレージ内の256MB境界に沿った領域を表現する構造体.
///
/// 初めてページを切り出す際に`PageClass`が割り当てられ、
/// 以後は(空になってリセットされるまでは)同じクラスのページのみを切り出す.
///
/// `Small`と`Medium`では固定サイズのページを先頭から順に切り出し、
/// 解放されたページのスロットは再利用される.
/// `Large`ではページサイズが可変となるので、解放された領域は`FreeRanges`で管理される.
///
/// 256MBを超える`Large`ブロックは、連続する複数のセグメントに跨って配置される.
/// その場合、先頭のセグメントがページを保持し、残りのセグメントは先頭の"続き"として扱われる.
#[derive(Debug)]
pub struct SegmentDescr {
    index: usize,
    page_class: Option<PageClass>,
    cursor: u64,
    pages: BTreeMap<u64, Handle>,
    free_slots: BTreeSet<u64>,
    free_ranges: FreeRanges,
    continuation_of: Option<usize>,
}
impl SegmentDescr {
    /// `index`番目(先頭位置は`index << SEGMENT_SHIFT`)のセグメントを生成する.
    pub fn new(index: usize) -> Self {
        SegmentDescr {
            index,
            page_class: None,
            cursor: 0,
            pages: BTreeMap::new(),
            free_slots: BTreeSet::new(),
            free_ranges: FreeRanges::new(),
            continuation_of: None,
        }
    }

    /// バッキングストレージ内でのセグメントの先頭位置.
    pub fn base(&self) -> u64 {
        (self.index as u64) << SEGMENT_SHIFT
    }

    pub fn page_class(&self) -> Option<PageClass> {
        self.page_class
    }

    /// 未使用領域の先頭位置 (セグメント先頭からの相対値).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// このセグメントが、別のセグメントを先頭とするブロックの一部となっている場合には、先頭セグメントの番号を返す.
    pub fn continuation_of(&self) -> Option<usize> {
        self.continuation_of
    }

    pub fn is_unassigned(&self) -> bool {
        self.page_class.is_none()
    }

    /// ページを一つ以上切り出す余地があるかどうか.
    ///
    /// `Large`の場合は、特定のサイズのページを切り出せることまでは保証されない.
    pub fn has_room(&self) -> bool {
        if self.continuation_of.is_some() {
            return false;
        }
        match self.page_class {
            None => true,
            Some(PageClass::Large) => self.cursor < SEGMENT_SIZE || self.free_ranges.max_len() > 0,
            Some(class) => {
                let unit = class.page_size().unwrap_or(SEGMENT_SIZE);
                !self.free_slots.is_empty() || self.cursor + unit <= SEGMENT_SIZE
            }
        }
    }

    /// 新しいページを切り出して`pages`に登録する.
    ///
    /// 以下の場合には`None`が返される:
    ///
    /// - セグメントに別のページクラスが割り当てられている
    /// - 1ページ分の空きがない
    pub fn carve_page(
        &mut self,
        pages: &mut Arena<Page>,
        class: PageClass,
        bin: usize,
        block_size: u64,
    ) -> Option<Handle> {
        if !self.accepts(class) {
            return None;
        }
        let (offset, size) = if let Some(unit) = class.page_size() {
            let slot = self.free_slots.iter().next().cloned();
            if let Some(offset) = slot {
                self.free_slots.remove(&offset);
                (offset, unit)
            } else if self.cursor + unit <= SEGMENT_SIZE {
                self.cursor += unit;
                (self.cursor - unit, unit)
            } else {
                return None;
            }
        } else if let Some(offset) = self.free_ranges.allocate(block_size) {
            (offset, block_size)
        } else if self.cursor + block_size <= SEGMENT_SIZE {
            self.cursor += block_size;
            (self.cursor - block_size, block_size)
        } else {
            return None;
        };
        Some(self.attach(pages, class, offset, size, bin, block_size))
    }

    /// 指定位置に新しいページを切り出して`pages`に登録する.
    ///
    /// 状態の復元用.
    /// 指定位置がページ境界に沿っていない場合や、既に使用されている場合には`None`が返される.
    pub fn carve_page_at(
        &mut self,
        pages: &mut Arena<Page>,
        class: PageClass,
        offset: u64,
        bin: usize,
        block_size: u64,
    ) -> Option<Handle> {
        if !self.accepts(class) {
            return None;
        }
        let size = class.page_size().unwrap_or(block_size);
        if class != PageClass::Large && offset % size != 0 {
            return None;
        }
        if offset + size > SEGMENT_SIZE {
            return None;
        }
        if offset >= self.cursor {
            if let Some(unit) = class.page_size() {
                let mut slot = self.cursor;
                while slot < offset {
                    self.free_slots.insert(slot);
                    slot += unit;
                }
            } else if offset > self.cursor {
                self.free_ranges.release(self.cursor, offset - self.cursor);
            }
            self.cursor = offset + size;
        } else if class.page_size().is_some() {
            if !self.free_slots.remove(&offset) {
                return None;
            }
        } else if !self.free_ranges.take(offset, size) {
            return None;
        }
        Some(self.attach(pages, class, offset, size, bin, block_size))
    }

    /// 複数のセグメントに跨るページを、このセグメントの先頭に登録する.
    ///
    /// セグメントは未割当である必要がある.
    /// 後続のセグメントには、別途`mark_continuation`を呼び出す必要がある.
    pub fn carve_spanning_page(
        &mut self,
        pages: &mut Arena<Page>,
        bin: usize,
        block_size: u64,
    ) -> Handle {
        assert!(self.is_unassigned() && self.pages.is_empty());
        assert!(block_size > SEGMENT_SIZE);
        self.cursor = SEGMENT_SIZE;
        self.attach(pages, PageClass::Large, 0, block_size, bin, block_size)
    }

    /// このセグメントを、`head`番目のセグメントから始まるブロックの一部としてマークする.
    pub fn mark_continuation(&mut self, head: usize) {
        assert!(self.is_unassigned() && self.pages.is_empty());
        self.page_class = Some(PageClass::Large);
        self.cursor = SEGMENT_SIZE;
        self.continuation_of = Some(head);
    }

    /// セグメント内の相対位置`offset`を含むページを返す.
    pub fn find_page(&self, pages: &Arena<Page>, offset: u64) -> Option<Handle> {
        let (&start, &handle) = self.pages.range(..=offset).next_back()?;
        let page = pages.get(handle)?;
        if offset < start + page.size() {
            Some(handle)
        } else {
            None
        }
    }

    /// 空になったページをセグメントに回収する.
    ///
    /// ページが占めていた領域は、以後の`carve_page`で再利用される.
    /// 回収後にセグメント内の全ページが無くなった場合には`true`が返される.
    pub fn reclaim(&mut self, pages: &mut Arena<Page>, handle: Handle) -> bool {
        let page = pages.remove(handle).expect("stale page handle");
        assert!(page.is_empty(), "reclaiming a non-empty page");
        assert_eq!(page.segment(), self.index);
        assert_eq!(self.pages.remove(&page.offset()), Some(handle));

        if page.size() > SEGMENT_SIZE {
            // 複数セグメントに跨るページ
            self.cursor = 0;
        } else if let Some(unit) = self.page_class.and_then(|c| c.page_size()) {
            if page.offset() + unit == self.cursor {
                self.cursor -= unit;
                while self.cursor >= unit && self.free_slots.remove(&(self.cursor - unit)) {
                    self.cursor -= unit;
                }
            } else {
                self.free_slots.insert(page.offset());
            }
        } else {
            let merged = self.free_ranges.release(page.offset(), page.size());
            if merged.end() == self.cursor {
                self.free_ranges.remove_ending_at(self.cursor);
                self.cursor = merged.start();
            }
        }
        self.pages.is_empty()
    }

    /// セグメントを未割当の状態に戻す.
    ///
    /// 以後は任意のページクラスで再利用可能となる.
    pub fn reset(&mut self) {
        assert!(self.pages.is_empty(), "resetting a segment with live pages");
        self.page_class = None;
        self.cursor = 0;
        self.free_slots.clear();
        self.free_ranges.clear();
        self.continuation_of = None;
    }

    fn accepts(&self, class: PageClass) -> bool {
        self.continuation_of.is_none() && self.page_class.map_or(true, |c| c == class)
    }

    fn attach(
        &mut self,
        pages: &mut Arena<Page>,
        class: PageClass,
        offset: u64,
        size: u64,
        bin: usize,
        block_size: u64,
    ) -> Handle {
        self.page_class = Some(class);
        let handle = pages.insert(Page::new(self.index, offset, size, bin, block_size));
        assert!(self.pages.insert(offset, handle).is_none());
        handle
    }
}
