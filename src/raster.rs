use geo::{coord, Rect};
use ndarray::Array2;
use num_traits::ToPrimitive;

use crate::grid::{AlignedBlock, RasterGridSpec};
use crate::{PixelizeError, Result};

/// 栅格数据源能力
///
/// 像素化流程只需要数据源提供这些信息：范围、像素大小、无数据值，
/// 以及按对齐块读取某个波段的采样值。波段编号从1开始，与GDAL一致。
pub trait RasterSource: Send + Sync {
    /// 栅格在世界坐标中的范围
    fn extent(&self) -> Rect<f64>;

    /// x方向上一个像素的世界坐标宽度
    fn pixel_size_x(&self) -> f64;

    /// y方向上一个像素的世界坐标高度
    fn pixel_size_y(&self) -> f64;

    /// 波段数量
    fn band_count(&self) -> usize;

    /// 波段的无数据值；没有定义时返回`None`
    fn no_data_value(&self, band: usize) -> Option<f64>;

    /// 读取对齐块覆盖的采样值
    ///
    /// 返回块的形状必须是 `(block.height, block.width)`。
    fn read_block(&self, band: usize, block: &AlignedBlock) -> Result<RasterBlock>;

    /// 由范围和像素大小导出的网格描述
    fn grid(&self) -> Result<RasterGridSpec> {
        RasterGridSpec::from_extent(self.extent(), self.pixel_size_x(), self.pixel_size_y())
    }
}

/// 从栅格中读出的一块采样值，按 `(row, col)` 寻址，第0行在最上方。
#[derive(Debug, Clone, PartialEq)]
pub struct RasterBlock {
    values: Array2<f64>,
    no_data: Option<f64>,
}

impl RasterBlock {
    pub fn new(values: Array2<f64>, no_data: Option<f64>) -> Self {
        RasterBlock { values, no_data }
    }

    /// 块的形状 `(height, width)`
    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn no_data(&self) -> Option<f64> {
        self.no_data
    }

    /// 读取 `(row, col)` 处的采样值，越界时返回`None`
    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        self.values.get((row, col)).copied()
    }

    /// 判断采样值是否为无数据
    ///
    /// NaN 总是视为无数据（栅格范围外或无法读取的像素）。
    /// 无数据值为0时同样生效。
    pub fn is_no_data(&self, value: f64) -> bool {
        value.is_nan() || self.no_data == Some(value)
    }
}

/// 基于内存数组的栅格数据源
///
/// 每个波段是一个 `Array2<T>`，形状为 `(rows, cols)`，第0行对应栅格的最北端。
///
/// # 示例
///
/// ```rust
/// # fn main() -> geo_pixelize::Result<()> {
/// use geo_pixelize::{MemoryRaster, RasterSource};
/// use ndarray::array;
///
/// let raster = MemoryRaster::new(0., 0., 1., 1., vec![array![[1u8, 2], [3, 4]]])?
///     .with_no_data(1, 0)?;
/// assert_eq!(raster.extent().max().y, 2.);
/// assert_eq!(raster.no_data_value(1), Some(0.));
/// # Ok(())}
/// ```
#[derive(Debug, Clone)]
pub struct MemoryRaster<T> {
    bands: Vec<Array2<T>>,
    no_data: Vec<Option<T>>,
    extent: Rect<f64>,
    pixel_size_x: f64,
    pixel_size_y: f64,
}

impl<T> MemoryRaster<T>
where
    T: Copy + ToPrimitive + Send + Sync,
{
    /// 创建内存栅格
    ///
    /// # 参数
    /// * `x_min`, `y_min` - 栅格左下角的世界坐标
    /// * `pixel_size_x`, `pixel_size_y` - 像素大小
    /// * `bands` - 各波段的数据，形状必须一致
    ///
    /// # 错误
    /// 像素大小无效时返回[PixelizeError::InvalidGrid]；
    /// 没有波段或波段形状不一致时返回[PixelizeError::DataUnavailable]
    pub fn new(
        x_min: f64,
        y_min: f64,
        pixel_size_x: f64,
        pixel_size_y: f64,
        bands: Vec<Array2<T>>,
    ) -> Result<Self> {
        // 借用网格描述做参数校验
        RasterGridSpec::new(x_min, y_min, pixel_size_x, pixel_size_y)?;

        let (rows, cols) = bands
            .first()
            .map(Array2::dim)
            .ok_or_else(|| PixelizeError::DataUnavailable("栅格没有任何波段".to_string()))?;
        if bands.iter().any(|band| band.dim() != (rows, cols)) {
            return Err(PixelizeError::DataUnavailable(
                "各波段的形状不一致".to_string(),
            ));
        }

        let extent = Rect::new(
            coord! { x: x_min, y: y_min },
            coord! {
                x: x_min + cols as f64 * pixel_size_x,
                y: y_min + rows as f64 * pixel_size_y,
            },
        );
        Ok(MemoryRaster {
            no_data: vec![None; bands.len()],
            bands,
            extent,
            pixel_size_x,
            pixel_size_y,
        })
    }

    /// 为某个波段设置无数据值
    pub fn with_no_data(mut self, band: usize, value: T) -> Result<Self> {
        let index = self.band_index(band)?;
        self.no_data[index] = Some(value);
        Ok(self)
    }

    fn band_index(&self, band: usize) -> Result<usize> {
        if band == 0 || band > self.bands.len() {
            return Err(PixelizeError::DataUnavailable(format!(
                "波段{band}不存在（共{}个波段）",
                self.bands.len()
            )));
        }
        Ok(band - 1)
    }

    /// 世界坐标所在的栅格行列号，位于栅格外时返回`None`
    fn locate(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.extent.min().x) / self.pixel_size_x).floor();
        let row = ((self.extent.max().y - y) / self.pixel_size_y).floor();
        let (rows, cols) = self.bands[0].dim();
        if col < 0. || row < 0. || col >= cols as f64 || row >= rows as f64 {
            return None;
        }
        Some((row as usize, col as usize))
    }
}

impl<T> RasterSource for MemoryRaster<T>
where
    T: Copy + ToPrimitive + Send + Sync,
{
    fn extent(&self) -> Rect<f64> {
        self.extent
    }

    fn pixel_size_x(&self) -> f64 {
        self.pixel_size_x
    }

    fn pixel_size_y(&self) -> f64 {
        self.pixel_size_y
    }

    fn band_count(&self) -> usize {
        self.bands.len()
    }

    fn no_data_value(&self, band: usize) -> Option<f64> {
        let index = self.band_index(band).ok()?;
        self.no_data[index].and_then(|value| value.to_f64())
    }

    /// 在每个对齐像素的中心采样；栅格范围外的像素填充为NaN
    fn read_block(&self, band: usize, block: &AlignedBlock) -> Result<RasterBlock> {
        let data = &self.bands[self.band_index(band)?];
        let transform = block.pix_to_geo();

        let values = Array2::from_shape_fn((block.height, block.width), |(row, col)| {
            let centre = transform
                .transform_point(euclid::point2(col as f64 + 0.5, row as f64 + 0.5));
            self.locate(centre.x, centre.y)
                .and_then(|index| data[index].to_f64())
                .unwrap_or(f64::NAN)
        });
        Ok(RasterBlock::new(values, self.no_data_value(band)))
    }
}
