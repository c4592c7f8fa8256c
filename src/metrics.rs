//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, Gauge, MetricBuilder};

use crate::size_class::PageClass;

/// `ExternalAllocator`のメトリクス.
#[derive(Debug, Clone)]
pub struct AllocatorMetrics {
    pub(crate) capacity_bytes: Gauge,
    pub(crate) pending_bytes: Gauge,
    pub(crate) allocations_at_starting: Counter,
    pub(crate) allocations_at_running: Counter,
    pub(crate) allocated_bytes_at_starting: Counter,
    pub(crate) allocated_bytes_at_running: Counter,
    pub(crate) releases: Counter,
    pub(crate) released_bytes: Counter,
    pub(crate) need_storage: Counter,
    pub(crate) segments_claimed: Counter,
    pub(crate) segments_recycled: Counter,
    pub(crate) pages_carved: PageClassCounter,
    pub(crate) pages_reclaimed: PageClassCounter,
}
impl AllocatorMetrics {
    /// 登録済みのバッキングストレージの容量.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// extalloc_allocator_capacity_bytes <GAUGE>
    /// ```
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes.value() as u64
    }

    /// 登録済みだが、まだセグメント化されていない領域のサイズ.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// extalloc_allocator_pending_bytes <GAUGE>
    /// ```
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes.value() as u64
    }

    /// ブロックの割当回数.
    ///
    /// `phase="starting"`は、状態の復元時に割当済みとして登録されたブロックの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// extalloc_allocator_allocations_total { phase="starting|running" } <COUNTER>
    /// ```
    pub fn allocations(&self) -> u64 {
        self.allocations_at_starting.value() as u64 + self.allocations_at_running.value() as u64
    }

    /// これまでに割り当てたブロックのバイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// extalloc_allocator_allocated_bytes_total { phase="starting|running" } <COUNTER>
    /// ```
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes_at_starting.value() as u64
            + self.allocated_bytes_at_running.value() as u64
    }

    /// ブロックの解放回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// extalloc_allocator_releases_total <COUNTER>
    /// ```
    pub fn releases(&self) -> u64 {
        self.releases.value() as u64
    }

    /// これまでに解放されたブロックのバイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// extalloc_allocator_released_bytes_total <COUNTER>
    /// ```
    pub fn released_bytes(&self) -> u64 {
        self.released_bytes.value() as u64
    }

    /// 割当済みブロックの合計サイズ.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// sum(extalloc_allocator_allocated_bytes_total) - extalloc_allocator_released_bytes_total
    /// ```
    pub fn usage_bytes(&self) -> u64 {
        // NOTE: 以下の順番で値を取得しないとアンダーフローする可能性がある
        let dec = self.released_bytes();
        let inc = self.allocated_bytes();
        inc - dec
    }

    /// バッキングストレージの不足を通知した回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// extalloc_allocator_need_storage_total <COUNTER>
    /// ```
    pub fn need_storage(&self) -> u64 {
        self.need_storage.value() as u64
    }

    /// キューから取り出されてセグメント化された領域の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// extalloc_allocator_segments_claimed_total <COUNTER>
    /// ```
    pub fn segments_claimed(&self) -> u64 {
        self.segments_claimed.value() as u64
    }

    /// 空になって未割当状態に戻されたセグメントの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// extalloc_allocator_segments_recycled_total <COUNTER>
    /// ```
    pub fn segments_recycled(&self) -> u64 {
        self.segments_recycled.value() as u64
    }

    /// セグメントから切り出されたページの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// extalloc_allocator_pages_carved_total { class="small|medium|large" } <COUNTER>
    /// ```
    pub fn pages_carved(&self) -> &PageClassCounter {
        &self.pages_carved
    }

    /// セグメントに回収されたページの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// extalloc_allocator_pages_reclaimed_total { class="small|medium|large" } <COUNTER>
    /// ```
    pub fn pages_reclaimed(&self) -> &PageClassCounter {
        &self.pages_reclaimed
    }

    /// 現在生存中のページの数.
    pub fn live_pages(&self) -> u64 {
        // NOTE: 以下の順番で値を取得しないとアンダーフローする可能性がある
        let dec = self.pages_reclaimed.sum();
        let inc = self.pages_carved.sum();
        inc - dec
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("extalloc").subsystem("allocator");
        AllocatorMetrics {
            capacity_bytes: builder
                .gauge("capacity_bytes")
                .help("Capacity of the registered backing storage")
                .finish()
                .expect("Never fails"),
            pending_bytes: builder
                .gauge("pending_bytes")
                .help("Registered bytes not yet converted into segments")
                .finish()
                .expect("Never fails"),
            allocations_at_starting: builder
                .counter("allocations_total")
                .help("Number of allocated blocks")
                .label("phase", "starting")
                .finish()
                .expect("Never fails"),
            allocations_at_running: builder
                .counter("allocations_total")
                .help("Number of allocated blocks")
                .label("phase", "running")
                .finish()
                .expect("Never fails"),
            allocated_bytes_at_starting: builder
                .counter("allocated_bytes_total")
                .help("Number of allocated bytes")
                .label("phase", "starting")
                .finish()
                .expect("Never fails"),
            allocated_bytes_at_running: builder
                .counter("allocated_bytes_total")
                .help("Number of allocated bytes")
                .label("phase", "running")
                .finish()
                .expect("Never fails"),
            releases: builder
                .counter("releases_total")
                .help("Number of released blocks")
                .finish()
                .expect("Never fails"),
            released_bytes: builder
                .counter("released_bytes_total")
                .help("Number of released bytes")
                .finish()
                .expect("Never fails"),
            need_storage: builder
                .counter("need_storage_total")
                .help("Number of allocation requests answered with a storage demand")
                .finish()
                .expect("Never fails"),
            segments_claimed: builder
                .counter("segments_claimed_total")
                .help("Number of segments materialized from the pending storage")
                .finish()
                .expect("Never fails"),
            segments_recycled: builder
                .counter("segments_recycled_total")
                .help("Number of emptied segments returned to the unassigned state")
                .finish()
                .expect("Never fails"),
            pages_carved: PageClassCounter::new(
                &builder,
                "pages_carved_total",
                "Number of pages carved from segments",
            ),
            pages_reclaimed: PageClassCounter::new(
                &builder,
                "pages_reclaimed_total",
                "Number of emptied pages reclaimed into segments",
            ),
        }
    }

    pub(crate) fn count_allocation(&self, block_size: u64) {
        self.allocations_at_running.increment();
        self.allocated_bytes_at_running.add_u64(block_size);
    }

    pub(crate) fn count_restored_allocation(&self, block_size: u64) {
        self.allocations_at_starting.increment();
        self.allocated_bytes_at_starting.add_u64(block_size);
    }

    pub(crate) fn count_releasion(&self, block_size: u64) {
        self.releases.increment();
        self.released_bytes.add_u64(block_size);
    }
}

/// ページクラス毎のカウンタ.
#[derive(Debug, Clone)]
pub struct PageClassCounter {
    pub(crate) small: Counter,
    pub(crate) medium: Counter,
    pub(crate) large: Counter,
}
impl PageClassCounter {
    /// `Small`ページの数.
    pub fn small(&self) -> u64 {
        self.small.value() as u64
    }

    /// `Medium`ページの数.
    pub fn medium(&self) -> u64 {
        self.medium.value() as u64
    }

    /// `Large`ページの数.
    pub fn large(&self) -> u64 {
        self.large.value() as u64
    }

    pub(crate) fn increment(&self, class: PageClass) {
        match class {
            PageClass::Small => self.small.increment(),
            PageClass::Medium => self.medium.increment(),
            PageClass::Large => self.large.increment(),
        }
    }

    fn new(builder: &MetricBuilder, name: &str, help: &str) -> Self {
        let counter = |class: PageClass| {
            builder
                .counter(name)
                .help(help)
                .label("class", class.as_str())
                .finish()
                .expect("Never fails")
        };
        PageClassCounter {
            small: counter(PageClass::Small),
            medium: counter(PageClass::Medium),
            large: counter(PageClass::Large),
        }
    }

    fn sum(&self) -> u64 {
        self.small() + self.medium() + self.large()
    }
}
