//! External Storage Allocator.
//!
//! `extalloc`は、外部で管理されているバッキングストレージ(e.g., ファイルやSSD)のアドレス空間を、
//! 可変長のブロック群に分割して割り当てるためのアロケータ.
//!
//! # 特徴
//!
//! - 領域の計算処理のみを担当し、バッキングストレージ自体の読み書きは一切行わない
//! - ブロッキングしない
//!   - 容量が足りない場合には、必要なストレージのサイズが呼び出し元に返される
//!   - 呼び出し元がストレージを拡張して登録した後に、同じ要求を再発行すれば必ず成功する
//! - [mimalloc]風のサイズクラス方式:
//!   - 要求サイズは35個のビン(サイズクラス)のいずれかに丸められる
//!   - 同じビンのブロックは、同じページにまとめて配置される
//! - 内部でロックは取らない (利用者側で排他を行う必要がある)
//!
//! # モジュールの依存関係
//!
//! ```text
//! allocator => size_class
//!           => metrics
//! ```
//!
//! - [allocator]モジュール:
//!   - 主に[ExternalAllocator]構造体を提供
//!   - `extalloc`の利用者が直接触るのはこの構造体
//! - [size_class]モジュール:
//!   - 要求サイズからブロックサイズおよびページクラスへの対応付けを提供
//! - [metrics]モジュール:
//!   - [Prometheus]形式のメトリクスを提供
//!
//! # Examples
//!
//! ```
//! use extalloc::{AllocResult, ExternalAllocator};
//!
//! let mut allocator = ExternalAllocator::new();
//! let size = 10_000;
//!
//! let offset = match allocator.allocate(size) {
//!     AllocResult::Offset(offset) => offset,
//!     AllocResult::NeedStorage(needed) => {
//!         // 本来なら、ここでバッキングストレージを拡張する
//!         let capacity = allocator.capacity();
//!         allocator.register_extent(capacity, needed);
//!         allocator.allocate(size).offset().unwrap()
//!     }
//! };
//! assert_eq!(allocator.allocated_bytes(), ExternalAllocator::good_size(size));
//!
//! allocator.free(offset, size);
//! ```
//!
//! [mimalloc]: https://github.com/microsoft/mimalloc
//! [allocator]: ./allocator/index.html
//! [ExternalAllocator]: ./allocator/struct.ExternalAllocator.html
//! [size_class]: ./size_class/index.html
//! [metrics]: ./metrics/index.html
//! [Prometheus]: https://prometheus.io/
#![warn(missing_docs)]
extern crate prometrics;
#[cfg(test)]
extern crate rand;
#[macro_use]
extern crate trackable;
#[macro_use]
extern crate slog;

pub use crate::allocator::{AllocResult, AllocatorBuilder, ExternalAllocator};
pub use crate::error::{Error, ErrorKind};

pub mod allocator;
pub mod metrics;
pub mod size_class;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
