use geo::{BooleanOps, MultiPolygon};
use itertools::Itertools;

/// 合并两个几何
///
/// 累加值为空时直接返回 `item`，否则返回两者的并集。
/// 并集满足结合律和交换律，因此既可以作为工作线程内的本地聚合函数，
/// 也可以用于跨工作线程的最终合并。
pub fn combine(accumulator: Option<MultiPolygon<f64>>, item: MultiPolygon<f64>) -> MultiPolygon<f64> {
    match accumulator {
        None => item,
        Some(accumulator) => accumulator.union(&item),
    }
}

/// 以平衡树的方式合并所有部分，没有任何部分时返回`None`
pub fn combine_all<I>(parts: I) -> Option<MultiPolygon<f64>>
where
    I: IntoIterator<Item = MultiPolygon<f64>>,
{
    parts
        .into_iter()
        .tree_reduce(|left, right| combine(Some(left), right))
}
