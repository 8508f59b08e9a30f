use euclid::{Transform2D, UnknownUnit};
use geo::{coord, Rect};
use itertools::iproduct;

use crate::{PixelizeError, Result};

/// 仿射变换，用于描述如何将对齐块内的像素坐标 `(col, row)` 转换为世界空间坐标。
pub type Transform = Transform2D<f64, UnknownUnit, UnknownUnit>;
/// 欧几里得点类型，用于内部坐标计算和转换操作。
type EuclidPoint = euclid::Point2D<f64, UnknownUnit>;

/// 截断宽高时容许的浮点误差（以像素为单位）
///
/// 重新对齐一个已经对齐的矩形时，`width / pixel_size` 可能得到 `n - ε`，
/// 没有这个容差就会少算一列。
const SNAP_TOLERANCE: f64 = 1e-9;

/// 栅格网格描述：原点与每个轴向上的像素大小。
///
/// 原点取栅格范围的最小角点 `(x_min, y_min)`，像素大小以世界坐标单位表示。
/// 每次运行只从栅格数据源创建一次，之后只读。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterGridSpec {
    origin_x: f64,
    origin_y: f64,
    pixel_size_x: f64,
    pixel_size_y: f64,
}

impl RasterGridSpec {
    /// 创建一个新的网格描述
    ///
    /// # 参数
    /// * `origin_x`, `origin_y` - 网格原点（栅格范围的最小角点）
    /// * `pixel_size_x`, `pixel_size_y` - 每个轴向上一个像素的世界坐标宽度
    ///
    /// # 错误
    /// 任一参数不是有限值，或像素大小不为正时，返回[PixelizeError::InvalidGrid]
    pub fn new(origin_x: f64, origin_y: f64, pixel_size_x: f64, pixel_size_y: f64) -> Result<Self> {
        if !(origin_x.is_finite() && origin_y.is_finite()) {
            return Err(PixelizeError::InvalidGrid(format!(
                "网格原点不是有限值: ({origin_x}, {origin_y})"
            )));
        }
        let valid_size = |size: f64| size.is_finite() && size > 0.;
        if !(valid_size(pixel_size_x) && valid_size(pixel_size_y)) {
            return Err(PixelizeError::InvalidGrid(format!(
                "像素大小必须为正的有限值: ({pixel_size_x}, {pixel_size_y})"
            )));
        }
        Ok(RasterGridSpec {
            origin_x,
            origin_y,
            pixel_size_x,
            pixel_size_y,
        })
    }

    /// 根据栅格范围和像素大小创建网格描述
    pub fn from_extent(extent: Rect<f64>, pixel_size_x: f64, pixel_size_y: f64) -> Result<Self> {
        let (min, max) = (extent.min(), extent.max());
        if ![min.x, min.y, max.x, max.y].iter().all(|v| v.is_finite()) {
            return Err(PixelizeError::InvalidGrid("栅格范围不是有限值".to_string()));
        }
        RasterGridSpec::new(min.x, min.y, pixel_size_x, pixel_size_y)
    }

    pub fn origin_x(&self) -> f64 {
        self.origin_x
    }

    pub fn origin_y(&self) -> f64 {
        self.origin_y
    }

    pub fn pixel_size_x(&self) -> f64 {
        self.pixel_size_x
    }

    pub fn pixel_size_y(&self) -> f64 {
        self.pixel_size_y
    }

    /// 单个像素的面积
    pub fn pixel_area(&self) -> f64 {
        self.pixel_size_x * self.pixel_size_y
    }

    /// 对齐前包围盒需要向外扩展的距离：两个像素大小中较大的一个
    ///
    /// 多边形真正覆盖的像素最多可以超出其紧致包围盒一个像素。
    pub fn padding(&self) -> f64 {
        self.pixel_size_x.max(self.pixel_size_y)
    }

    /// 将任意矩形对齐到栅格网格
    ///
    /// 最小角点吸附到最近的网格线（四舍五入，0.5时远离零取整），
    /// 宽高按整像素截断，因此对齐后的块永远不会超出输入矩形的尺寸。
    ///
    /// # 参数
    /// * `rect` - 要对齐的矩形
    ///
    /// # 返回值
    /// 边线全部落在网格线上的[AlignedBlock]
    pub fn align(&self, rect: Rect<f64>) -> AlignedBlock {
        let x_min = snap(rect.min().x, self.origin_x, self.pixel_size_x);
        let y_min = snap(rect.min().y, self.origin_y, self.pixel_size_y);

        let width = whole_cells(rect.width(), self.pixel_size_x);
        let height = whole_cells(rect.height(), self.pixel_size_y);

        let rect = Rect::new(
            coord! { x: x_min, y: y_min },
            coord! {
                x: x_min + width as f64 * self.pixel_size_x,
                y: y_min + height as f64 * self.pixel_size_y,
            },
        );
        AlignedBlock {
            rect,
            width,
            height,
            pixel_size_x: self.pixel_size_x,
            pixel_size_y: self.pixel_size_y,
        }
    }

    /// 先按[RasterGridSpec::padding]扩展矩形，再对齐到网格
    pub fn align_padded(&self, rect: Rect<f64>) -> AlignedBlock {
        self.align(buffer_rect(rect, self.padding()))
    }
}

/// 将坐标吸附到从 `origin` 出发、间隔为 `size` 的最近网格线
fn snap(value: f64, origin: f64, size: f64) -> f64 {
    origin + ((value - origin) / size).round() * size
}

/// 长度 `extent` 中完整包含的像素个数
fn whole_cells(extent: f64, size: f64) -> usize {
    let cells = (extent / size + SNAP_TOLERANCE).floor();
    if cells > 0. {
        cells as usize
    } else {
        0
    }
}

/// 将矩形的四条边各向外扩展 `distance`
pub fn buffer_rect(rect: Rect<f64>, distance: f64) -> Rect<f64> {
    let (min, max) = (rect.min(), rect.max());
    Rect::new(
        coord! { x: min.x - distance, y: min.y - distance },
        coord! { x: max.x + distance, y: max.y + distance },
    )
}

/// 对齐到栅格网格的矩形块，宽高均为整像素。
///
/// 块内像素按 `(row, col)` 寻址，第0行位于最上方（行号向下增长），
/// 即第 `row` 行的上边界为 `rect.max().y - row * pixel_size_y`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignedBlock {
    /// 对齐后的矩形
    pub rect: Rect<f64>,
    /// 宽度（像素数）
    pub width: usize,
    /// 高度（像素数）
    pub height: usize,
    pixel_size_x: f64,
    pixel_size_y: f64,
}

impl AlignedBlock {
    /// 块中像素的总数
    pub fn cell_count(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count() == 0
    }

    /// 像素 `(row, col)` 在行优先顺序中的序号
    pub fn cell_index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    /// 从块内像素坐标 `(col, row)` 到世界坐标的变换
    ///
    /// 原点是块的左上角，y轴向下翻转。
    pub fn pix_to_geo(&self) -> Transform {
        Transform::scale(self.pixel_size_x, -self.pixel_size_y)
            .then_translate(euclid::vec2(self.rect.min().x, self.rect.max().y))
    }

    /// 计算像素 `(row, col)` 所占的世界坐标矩形
    ///
    /// 相邻像素的公共边由同一个变换计算，因此完全相等，合并时不会留下缝隙。
    pub fn cell_rect(&self, row: usize, col: usize) -> Rect<f64> {
        let transform = self.pix_to_geo();
        let top_left = transform.transform_point(EuclidPoint::new(col as f64, row as f64));
        let bottom_right =
            transform.transform_point(EuclidPoint::new((col + 1) as f64, (row + 1) as f64));
        Rect::new(top_left.to_tuple(), bottom_right.to_tuple())
    }

    /// 按行优先顺序遍历块中所有像素
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize)> {
        iproduct!(0..self.height, 0..self.width)
    }
}
