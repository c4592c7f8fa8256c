//! 要求サイズからブロックサイズを決定するためのサイズクラス表.
//!
//! 要求サイズは、以下のいずれかのページクラスに分類される:
//!
//! - `Small`: ブロックサイズが128KB以下 (ページサイズは1MB)
//! - `Medium`: ブロックサイズが1MB以下 (ページサイズは8MB)
//! - `Large`: 1MBを超えるもの (ページサイズはブロックサイズと等しい)
//!
//! `Small`と`Medium`では、34個のビン(`0..=33`)のいずれかにサイズが切り上げられる.
//! `Large`は全て`LARGE_SIZE_BIN`に属し、`LARGE_BLOCK_ALIGNMENT`の倍数に切り上げられる.

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// セグメントのサイズ(バイト単位).
///
/// バッキングストレージの登録およびセグメントの生成は、この値の境界で行われる.
pub const SEGMENT_SIZE: u64 = 1 << SEGMENT_SHIFT;

/// オフセットからセグメント番号を得るためのシフト幅.
pub const SEGMENT_SHIFT: u32 = 28;

/// ブロックサイズの最小値.
///
/// 全てのブロックサイズ(およびアロケータが返すオフセット)は、この値の倍数となる.
pub const MIN_BLOCK_SIZE: u64 = 4 * KB;

/// `Large`クラスのブロックサイズの切り上げ単位.
pub const LARGE_BLOCK_ALIGNMENT: u64 = 4 * KB;

/// `Small`クラスのページサイズ.
pub const SMALL_PAGE_SIZE: u64 = MB;

/// `Medium`クラスのページサイズ.
pub const MEDIUM_PAGE_SIZE: u64 = 8 * MB;

/// `Small`クラスに分類されるブロックサイズの上限 (この値を含む).
pub const SMALL_MAX_BLOCK_SIZE: u64 = 128 * KB;

/// `Medium`クラスに分類されるブロックサイズの上限 (この値を含む).
pub const MEDIUM_MAX_BLOCK_SIZE: u64 = MB;

/// 割当可能なブロックサイズの上限 (この値を含む).
///
/// `SEGMENT_SIZE`の倍数の中で、`u64`で表現可能な最大のもの.
/// これを超える要求サイズは、利用規約違反としてパニックを引き起こす.
pub const MAX_BLOCK_SIZE: u64 = u64::MAX / SEGMENT_SIZE * SEGMENT_SIZE;

/// `Large`クラス用のビン番号.
pub const LARGE_SIZE_BIN: usize = 34;

/// ビンの総数.
pub const NUM_SIZE_BINS: usize = LARGE_SIZE_BIN + 1;

// KB単位.
//
// 48KBまでは4KB刻み、それ以降は隣接するビンとの比が1.25以下になるように並べている.
// 128KBまでが`Small`、残りが`Medium`.
const BIN_SIZES_KB: [u16; LARGE_SIZE_BIN] = [
    4, 8, 12, 16, 20, 24, 28, 32, 36, 40, 44, 48, 56, 64, 72, 80, 96, 112, 128, // Small
    144, 160, 192, 224, 256, 288, 320, 384, 448, 512, 576, 640, 768, 896, 1024, // Medium
];

/// ページクラス.
///
/// ページクラスによって、セグメントから切り出されるページのサイズと、
/// そのページが扱うことのできるビンの範囲、が決定される.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageClass {
    /// 128KB以下のブロック用 (ページサイズは1MB).
    Small,

    /// 1MB以下のブロック用 (ページサイズは8MB).
    Medium,

    /// 1MBを超えるブロック用 (一つのページが一つのブロックのみを保持する).
    Large,
}
impl PageClass {
    /// ページクラスに固定のページサイズを返す.
    ///
    /// `Large`の場合にはページサイズはブロックサイズに依存するので`None`が返される.
    pub fn page_size(self) -> Option<u64> {
        match self {
            PageClass::Small => Some(SMALL_PAGE_SIZE),
            PageClass::Medium => Some(MEDIUM_PAGE_SIZE),
            PageClass::Large => None,
        }
    }

    /// ログやメトリクス用の名前.
    pub fn as_str(self) -> &'static str {
        match self {
            PageClass::Small => "small",
            PageClass::Medium => "medium",
            PageClass::Large => "large",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// `classify`関数の結果.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeClass {
    /// ブロックを格納するページのクラス.
    pub page_class: PageClass,

    /// ビン番号 (`0..=LARGE_SIZE_BIN`).
    pub bin: usize,

    /// 実際に割り当てられるブロックのサイズ.
    pub block_size: u64,
}

/// 要求サイズを分類する.
///
/// # Panics
///
/// `size`が`0`、あるいは`MAX_BLOCK_SIZE`を超える場合には、現在のスレッドがパニックする.
///
/// # Examples
///
/// ```
/// use extalloc::size_class::{classify, PageClass, LARGE_SIZE_BIN};
///
/// let c = classify(100);
/// assert_eq!(c.page_class, PageClass::Small);
/// assert_eq!(c.bin, 0);
/// assert_eq!(c.block_size, 4096);
///
/// let c = classify(128 * 1024);
/// assert_eq!(c.page_class, PageClass::Small);
///
/// let c = classify(128 * 1024 + 1);
/// assert_eq!(c.page_class, PageClass::Medium);
///
/// let c = classify(1024 * 1024 + 1);
/// assert_eq!(c.page_class, PageClass::Large);
/// assert_eq!(c.bin, LARGE_SIZE_BIN);
/// ```
pub fn classify(size: u64) -> SizeClass {
    assert_ne!(size, 0, "zero-sized allocation");
    assert!(size <= MAX_BLOCK_SIZE, "too large allocation size: {}", size);
    if size > MEDIUM_MAX_BLOCK_SIZE {
        return SizeClass {
            page_class: PageClass::Large,
            bin: LARGE_SIZE_BIN,
            block_size: align_up(size, LARGE_BLOCK_ALIGNMENT),
        };
    }

    let bin = BIN_SIZES_KB.partition_point(|&kb| u64::from(kb) * KB < size);
    let block_size = u64::from(BIN_SIZES_KB[bin]) * KB;
    let page_class = if block_size <= SMALL_MAX_BLOCK_SIZE {
        PageClass::Small
    } else {
        PageClass::Medium
    };
    SizeClass {
        page_class,
        bin,
        block_size,
    }
}

/// `size`分の割当を要求した際に、実際に確保されるブロックのサイズを返す.
///
/// 結果は`size`以上であることが保証されている.
/// アロケータの状態には依存しない.
///
/// # Panics
///
/// `size`が`0`、あるいは`MAX_BLOCK_SIZE`を超える場合には、現在のスレッドがパニックする.
///
/// # Examples
///
/// ```
/// use extalloc::size_class::good_size;
///
/// assert_eq!(good_size(1), 4096);
/// assert_eq!(good_size(4096), 4096);
/// assert_eq!(good_size(4097), 8192);
/// assert_eq!(good_size(2_000_000), 2_002_944);
/// ```
pub fn good_size(size: u64) -> u64 {
    classify(size).block_size
}

/// ビン番号に対応するブロックサイズを返す.
///
/// `Large`用のビンや範囲外の番号に対しては`None`が返される.
pub fn bin_size(bin: usize) -> Option<u64> {
    BIN_SIZES_KB.get(bin).map(|&kb| u64::from(kb) * KB)
}

/// `value`を`alignment`の倍数に切り上げる.
///
/// 結果が`u64`で表現できない場合にはパニックする.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    let rounded = value
        .checked_add(alignment - 1)
        .unwrap_or_else(|| panic!("too large value: {}", value));
    rounded / alignment * alignment
}

/// `block_size`を保持するのに必要なセグメントの数.
pub(crate) fn segments_for(block_size: u64) -> u64 {
    block_size / SEGMENT_SIZE + u64::from(block_size % SEGMENT_SIZE != 0)
}
