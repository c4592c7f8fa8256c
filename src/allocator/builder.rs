use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};

use super::ExternalAllocator;
use crate::size_class::SEGMENT_SIZE;
use crate::{ErrorKind, Result};

/// `ExternalAllocator`のビルダ.
#[derive(Debug, Clone)]
pub struct AllocatorBuilder {
    pub(super) metrics: MetricBuilder,
    pub(super) logger: Logger,
    pub(super) recycle_segments: bool,
}
impl AllocatorBuilder {
    /// 新しい`AllocatorBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        AllocatorBuilder {
            metrics: MetricBuilder::new(),
            logger: Logger::root(Discard, o!()),
            recycle_segments: true,
        }
    }

    /// メトリクス用の共通設定を登録する.
    ///
    /// デフォルト値は`MetricBuilder::new()`.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// アロケータが使用するロガーを設定する.
    ///
    /// デフォルトでは、ログは全て破棄される.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// 空になったセグメントを、別のページクラス用に再利用するかどうかを設定する.
    ///
    /// `false`が指定された場合、一度ページクラスが決まったセグメントは、
    /// 空になった後も同じクラスのページ専用として使われ続ける.
    ///
    /// デフォルト値は`true`.
    pub fn recycle_segments(&mut self, enabled: bool) -> &mut Self {
        self.recycle_segments = enabled;
        self
    }

    /// 新しい(容量が`0`の)`ExternalAllocator`インスタンスを生成する.
    pub fn finish(&self) -> ExternalAllocator {
        ExternalAllocator::with_options(self)
    }

    /// 以前の割当状態を復元した`ExternalAllocator`インスタンスを生成する.
    ///
    /// `capacity`には、それまでに登録されていたバッキングストレージの合計サイズを指定する.
    /// この範囲は`[0, capacity)`の単一のエクステントとして登録される.
    ///
    /// `allocations`は、割当済みのブロックの`(位置, 要求サイズ)`の列.
    /// 各ブロックは、`ExternalAllocator::allocate`が返し得る位置に置かれている必要がある.
    /// (順序は問わない)
    ///
    /// # Errors
    ///
    /// 以下の場合には`ErrorKind::InvalidInput`エラーが返される:
    ///
    /// - ブロック同士が重なっている
    /// - ブロックが容量の範囲外にある
    /// - ブロックがページ境界や、他のページクラスの領域と整合しない位置に置かれている
    pub fn restore<I>(&self, capacity: u64, allocations: I) -> Result<ExternalAllocator>
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut allocator = self.finish();
        if capacity > 0 {
            track_assert_eq!(
                capacity % SEGMENT_SIZE,
                0,
                ErrorKind::InvalidInput,
                "capacity={}",
                capacity
            );
            allocator.register_extent(0, capacity);
        }

        let mut allocations = allocations.into_iter().collect::<Vec<_>>();
        allocations.sort();
        for (offset, size) in allocations {
            track!(allocator.restore_allocation(offset, size))?;
        }
        info!(allocator.logger, "Allocator state is restored";
              "capacity" => capacity,
              "allocated_bytes" => allocator.allocated_bytes(),
              "segments" => allocator.segment_count());
        Ok(allocator)
    }
}
impl Default for AllocatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
