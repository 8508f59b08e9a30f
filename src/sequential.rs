use geo::MultiPolygon;

use crate::aggregate::combine;
use crate::classify::CellClassifier;
use crate::raster::RasterSource;
use crate::stats::StatsAccumulator;
use crate::task::Pixelized;
use crate::Result;

/// 在当前线程中逐个像素完成像素化
///
/// 与[PixelizeTask](crate::PixelizeTask)使用同样的对齐和分类规则，
/// 但按行优先顺序依次合并每个匹配像素，不支持取消和进度回调。
/// 适合很小的几何，或作为并行结果的参照。
///
/// # 错误
/// 与[CellClassifier::prepare]相同；单个像素分类失败时返回[crate::PixelizeError::Job]
pub fn pixelize_sequential<R>(
    raster: &R,
    band: usize,
    geometry: &MultiPolygon<f64>,
) -> Result<Pixelized>
where
    R: RasterSource + ?Sized,
{
    let classifier = match CellClassifier::prepare(raster, band, geometry)? {
        Some(classifier) => classifier,
        None => return Ok(Pixelized::default()),
    };
    let block = *classifier.block();

    let mut stats = StatsAccumulator::new(block.cell_count());
    let mut merged = None;
    for (row, col) in block.cells() {
        let sample = classifier.classify(row, col)?;
        if let Some(value) = sample.value {
            stats.add(block.cell_index(row, col), value);
            merged = Some(combine(merged, sample.rect.to_polygon().into()));
        }
    }

    Ok(Pixelized {
        geometry: merged,
        stats: stats.finish(),
    })
}
