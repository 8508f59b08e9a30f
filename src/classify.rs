use geo::{Area, BooleanOps, BoundingRect, CoordsIter, Intersects, MultiPolygon, Rect};

use crate::grid::{AlignedBlock, RasterGridSpec};
use crate::pool::{JobError, JobResult};
use crate::raster::{RasterBlock, RasterSource};
use crate::{PixelizeError, Result};

/// 像素被视为"被覆盖"所需的最小重叠面积比例（闭区间，恰好50%也算覆盖）
pub const COVERAGE_THRESHOLD: f64 = 0.5;

/// 单个像素的分类结果
///
/// `value` 为 `None` 表示像素未被覆盖，或者其采样值是无数据；
/// 这种情况下 `rect` 只是占位，聚合阶段会忽略它。
#[derive(Debug, Clone, PartialEq)]
pub struct CellSample {
    pub row: usize,
    pub col: usize,
    pub rect: Rect<f64>,
    pub value: Option<f64>,
}

impl CellSample {
    /// 像素是否参与几何合并与统计
    pub fn is_match(&self) -> bool {
        self.value.is_some()
    }
}

/// 像素分类器
///
/// 持有一次运行中所有分类任务共享的只读数据：对齐块、目标几何与采样值块。
/// 所有方法都是纯函数，可以在多个线程中对不同像素并发调用。
#[derive(Debug, Clone)]
pub struct CellClassifier {
    block: AlignedBlock,
    pixel_area: f64,
    target: MultiPolygon<f64>,
    target_bounds: Option<Rect<f64>>,
    values: RasterBlock,
}

impl CellClassifier {
    pub fn new(
        block: AlignedBlock,
        grid: &RasterGridSpec,
        target: MultiPolygon<f64>,
        values: RasterBlock,
    ) -> Self {
        let target_bounds = target.bounding_rect();
        CellClassifier {
            block,
            pixel_area: grid.pixel_area(),
            target,
            target_bounds,
            values,
        }
    }

    /// 为一次运行准备分类器：校验输入、对齐扩展后的包围盒并读取采样值块
    ///
    /// # 返回值
    /// 目标几何没有任何坐标时返回`Ok(None)`，它不可能覆盖任何像素
    ///
    /// # 错误
    /// * [PixelizeError::NonFiniteCoordinate] - 目标几何含有NaN或无限坐标
    /// * [PixelizeError::InvalidGrid] - 栅格的像素大小或范围无效
    /// * [PixelizeError::DataUnavailable] - 无法读取采样值，或读到的块形状不对
    pub fn prepare<R>(raster: &R, band: usize, target: &MultiPolygon<f64>) -> Result<Option<Self>>
    where
        R: RasterSource + ?Sized,
    {
        let all_finite = target
            .coords_iter()
            .all(|coordinate| coordinate.x.is_finite() && coordinate.y.is_finite());
        if !all_finite {
            return Err(PixelizeError::NonFiniteCoordinate);
        }

        let grid = raster.grid()?;
        let bounds = match target.bounding_rect() {
            Some(bounds) => bounds,
            None => return Ok(None),
        };
        let block = grid.align_padded(bounds);

        let values = raster.read_block(band, &block)?;
        if values.shape() != (block.height, block.width) {
            return Err(PixelizeError::DataUnavailable(format!(
                "采样值块的形状为{:?}，期望({}, {})",
                values.shape(),
                block.height,
                block.width
            )));
        }

        Ok(Some(CellClassifier::new(block, &grid, target.clone(), values)))
    }

    pub fn block(&self) -> &AlignedBlock {
        &self.block
    }

    /// 像素与目标几何的重叠面积
    pub fn overlap_area(&self, cell: Rect<f64>) -> f64 {
        match self.target_bounds {
            Some(bounds) if bounds.intersects(&cell) => {
                let cell = MultiPolygon::from(cell.to_polygon());
                self.target.intersection(&cell).unsigned_area()
            }
            _ => 0.,
        }
    }

    /// 判断像素 `(row, col)` 是否被覆盖，被覆盖时读取并检查其采样值
    ///
    /// # 错误
    /// `(row, col)` 超出采样值块时返回[JobError::Failed]
    pub fn classify(&self, row: usize, col: usize) -> JobResult<CellSample> {
        let rect = self.block.cell_rect(row, col);
        let mut sample = CellSample {
            row,
            col,
            rect,
            value: None,
        };

        if self.overlap_area(rect) < self.pixel_area * COVERAGE_THRESHOLD {
            return Ok(sample);
        }

        let value = self.values.value(row, col).ok_or_else(|| {
            JobError::Failed(format!("像素({row}, {col})超出了采样值块的范围"))
        })?;
        if !self.values.is_no_data(value) {
            sample.value = Some(value);
        }
        Ok(sample)
    }
}
