//! Page.

/// セグメントから切り出された、単一のブロックサイズ専用の領域.
///
/// 空きブロックの管理は、完全にメモリ上のビットマップで行われる.
/// (バッキングストレージの内容には一切依存しない)
#[derive(Debug)]
pub struct Page {
    segment: usize,
    offset: u64,
    size: u64,
    bin: usize,
    block_size: u64,
    capacity: u32,
    used_count: u32,

    // 使用中のブロックに対応するビットが立っている.
    // `capacity`以降のビットは、常に使用中として扱う.
    bitmap: Vec<u64>,
}
impl Page {
    /// 新しい(全てのブロックが空いている)`Page`インスタンスを生成する.
    ///
    /// `offset`はセグメントの先頭からの相対位置.
    pub fn new(segment: usize, offset: u64, size: u64, bin: usize, block_size: u64) -> Self {
        assert!(block_size > 0);
        assert!(block_size <= size, "block={}, page={}", block_size, size);
        let capacity = (size / block_size) as u32;
        let words = (capacity as usize + 63) / 64;
        let mut bitmap = vec![0; words];
        let tail = capacity as usize % 64;
        if tail != 0 {
            bitmap[words - 1] = !0u64 << tail;
        }
        Page {
            segment,
            offset,
            size,
            bin,
            block_size,
            capacity,
            used_count: 0,
            bitmap,
        }
    }

    /// 空きブロックを一つ割り当てて、ページ先頭からの相対位置を返す.
    ///
    /// 空きブロックがない場合には`None`が返される.
    /// 複数の空きブロックがある場合には、位置が一番小さいものが選択される.
    pub fn try_allocate(&mut self) -> Option<u64> {
        let (i, word) = self
            .bitmap
            .iter_mut()
            .enumerate()
            .find(|(_, w)| **w != !0)?;
        let bit = (!*word).trailing_zeros();
        *word |= 1u64 << bit;
        self.used_count += 1;

        let index = i as u64 * 64 + u64::from(bit);
        Some(index * self.block_size)
    }

    /// 割当済みのブロックを解放する.
    ///
    /// # Panics
    ///
    /// `offset`がブロック境界に沿っていない場合や、
    /// 対応するブロックが割当済みではない場合には、現在のスレッドがパニックする.
    pub fn release(&mut self, offset: u64) {
        let index = self.block_index(offset);
        let (i, mask) = (index / 64, 1u64 << (index % 64));
        assert!(
            self.bitmap[i] & mask != 0,
            "double free: page={}, offset={}",
            self.offset,
            offset
        );
        self.bitmap[i] &= !mask;
        self.used_count -= 1;
    }

    /// 指定位置のブロックを割当済みとしてマークする.
    ///
    /// 範囲外や境界に沿わない位置、および既に割当済みのブロックが指定された場合には`false`が返される.
    pub fn mark_used(&mut self, offset: u64) -> bool {
        if offset % self.block_size != 0 || offset / self.block_size >= u64::from(self.capacity) {
            return false;
        }
        let index = (offset / self.block_size) as usize;
        let (i, mask) = (index / 64, 1u64 << (index % 64));
        if self.bitmap[i] & mask != 0 {
            return false;
        }
        self.bitmap[i] |= mask;
        self.used_count += 1;
        true
    }

    /// 全てのブロックが割当済みかどうか.
    pub fn is_full(&self) -> bool {
        self.used_count == self.capacity
    }

    /// 全てのブロックが空いているかどうか.
    pub fn is_empty(&self) -> bool {
        self.used_count == 0
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn bin(&self) -> usize {
        self.bin
    }

    /// 所属セグメントの番号.
    pub fn segment(&self) -> usize {
        self.segment
    }

    /// セグメント先頭からの相対位置.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// ページがセグメントから切り出した領域のサイズ.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn block_index(&self, offset: u64) -> usize {
        assert_eq!(
            offset % self.block_size,
            0,
            "misaligned offset: block_size={}, offset={}",
            self.block_size,
            offset
        );
        let index = offset / self.block_size;
        assert!(
            index < u64::from(self.capacity),
            "out of page: capacity={}, offset={}",
            self.capacity,
            offset
        );
        index as usize
    }
}
